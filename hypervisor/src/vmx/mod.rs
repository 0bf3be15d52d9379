//! Intel VMX: root entry, VMCS field encodings/lifecycle, the VMCS builder, and the
//! entry/exit/dispatch engine that runs a guest through VM-exits.

pub mod builder;
pub mod fields;
pub mod msr;
pub mod vcpu;
pub mod vmcs;

use core::arch::asm;
use core::arch::x86_64::{CpuidResult, __cpuid, __cpuid_count};

use utils::mem::PhysAddr;

pub use vmcs::VmxError;

const VMX_CR0_FIXED0: u32 = msr::IA32_VMX_CR0_FIXED0;
const VMX_CR0_FIXED1: u32 = msr::IA32_VMX_CR0_FIXED1;
const VMX_CR4_FIXED0: u32 = msr::IA32_VMX_CR4_FIXED0;
const VMX_CR4_FIXED1: u32 = msr::IA32_VMX_CR4_FIXED1;
const CR4_VMXE: u64 = 1 << 13;

fn read_cr0() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr0", out(reg) value, options(nomem, nostack));
    }
    value
}

unsafe fn write_cr0(value: u64) {
    unsafe {
        asm!("mov cr0, {}", in(reg) value, options(nostack));
    }
}

fn read_cr4() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr4", out(reg) value, options(nomem, nostack));
    }
    value
}

unsafe fn write_cr4(value: u64) {
    unsafe {
        asm!("mov cr4, {}", in(reg) value, options(nostack));
    }
}

/// Confirms CPUID leaf 1, ECX bit 5 (VMX) is set.
fn cpu_supports_vmx() -> bool {
    let CpuidResult { ecx, .. } = unsafe { __cpuid(1) };
    ecx & (1 << 5) != 0
}

/// Unlocks (or confirms unlocked-and-compatible) `IA32_FEATURE_CONTROL`.
///
/// If the MSR is already locked, bit 2 (VMX outside SMX) must already be set — BIOS/firmware
/// locked VMX off, which this code cannot undo. If unlocked, this sets bits 0 and 2 together and
/// writes back, then re-reads to confirm the write stuck.
fn enable_feature_control() -> Result<(), VmxError> {
    let value = msr::rdmsr64(msr::IA32_FEATURE_CONTROL);

    if value & msr::FEATURE_CONTROL_LOCK != 0 {
        if value & msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX == 0 {
            return Err(VmxError::VmxonInRoot);
        }
        return Ok(());
    }

    let new_value = value | msr::FEATURE_CONTROL_LOCK | msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX;
    unsafe {
        msr::wrmsr64(msr::IA32_FEATURE_CONTROL, new_value);
    }

    let confirm = msr::rdmsr64(msr::IA32_FEATURE_CONTROL);
    if confirm & (msr::FEATURE_CONTROL_LOCK | msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX)
        != (msr::FEATURE_CONTROL_LOCK | msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX)
    {
        return Err(VmxError::VmxonInRoot);
    }

    Ok(())
}

/// Adjusts CR0/CR4 to satisfy the VMX fixed-bit MSRs, setting CR4.VMXE.
fn fix_control_registers() {
    let cr0_fixed0 = msr::rdmsr64(VMX_CR0_FIXED0);
    let cr0_fixed1 = msr::rdmsr64(VMX_CR0_FIXED1);
    let cr0 = (read_cr0() | cr0_fixed0) & cr0_fixed1;
    unsafe {
        write_cr0(cr0);
    }

    let cr4_fixed0 = msr::rdmsr64(VMX_CR4_FIXED0);
    let cr4_fixed1 = msr::rdmsr64(VMX_CR4_FIXED1);
    let cr4 = ((read_cr4() | cr4_fixed0) & cr4_fixed1) | CR4_VMXE;
    unsafe {
        write_cr4(cr4);
    }
}

/// A VMXON region: the one region that must stay loaded (via `VMXON`) for the lifetime of root
/// operation, distinct from any per-guest VMCS region.
pub struct VmxonRegion {
    phys: PhysAddr,
}

impl VmxonRegion {
    /// Allocates a 4 KiB region, zeroes it, and stamps the VMCS revision identifier into its
    /// first 31 bits, per `IA32_VMX_BASIC[30:0]`.
    fn new() -> Result<Self, VmxError> {
        let phys = pmm::get()
            .alloc_4k_aligned()
            .map_err(|_| VmxError::Unknown(0))?;

        let virt = phys.phys2virt();
        let ptr: *mut u32 = virt.into();
        unsafe {
            core::ptr::write_bytes(ptr.cast::<u8>(), 0, pmm::BASIC_PAGE_SIZE);
            let revision_id = msr::rdmsr64(msr::IA32_VMX_BASIC) as u32 & 0x7FFF_FFFF;
            ptr.write(revision_id);
        }

        Ok(Self { phys })
    }

    unsafe fn vmxon(&self) -> Result<(), VmxError> {
        let addr = self.phys.0 as u64;
        let rflags: u64;
        unsafe {
            asm!(
                "vmxon [{addr}]",
                "pushfq",
                "pop {rflags}",
                addr = in(reg) &addr,
                rflags = out(reg) rflags,
            );
        }

        if rflags & 0x1 != 0 || rflags & 0x40 != 0 {
            return Err(VmxError::VmxonInRoot);
        }
        Ok(())
    }
}

/// Runs every VMX root-entry precondition in order and executes `VMXON`.
///
/// # Safety
/// Must run once, after `require_intel`-equivalent vendor confirmation and before any VMCS is
/// allocated.
pub unsafe fn enter_root_operation() -> Result<VmxonRegion, VmxError> {
    if !cpu_supports_vmx() {
        return Err(VmxError::VmxonInRoot);
    }

    enable_feature_control()?;
    fix_control_registers();

    let region = VmxonRegion::new()?;
    unsafe {
        region.vmxon()?;
    }

    logger::log_info!("VMX root operation entered");
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[macros::test_fn]
    fn test_cpu_supports_vmx_reads_real_cpuid() {
        // Smoke test: whatever the host reports, the function must not panic, and a CPU with
        // no VMX support (bit clear) must be rejected symmetrically.
        let ecx = unsafe { __cpuid_count(1, 0) }.ecx;
        assert_eq!(cpu_supports_vmx(), ecx & (1 << 5) != 0);
    }
}
