//! Populates a freshly allocated, current-and-active VMCS with control, host-state, and
//! guest-state fields.
//!
//! Everything the host side needs is read directly off the running CPU (segment selectors,
//! CR0/CR3/CR4, GDTR/IDTR) except the TR descriptor's base address, which requires knowing the
//! layout of the caller's GDT — that one value is the only thing the caller must supply.

use core::arch::asm;
use core::mem::size_of;

use pmm::PmmAllocator;
use utils::mem::VirtAddr;

use super::fields as f;
use super::msr;
use super::vcpu::{asm_vmexit, HOST_STACK_SIZE};
use super::vmcs::{vmwrite, VmxError};

const PIN_BASED_NONE: u32 = 0;

const PRIMARY_HLT_EXITING: u32 = 1 << 7;

const ENTRY_IA32E_MODE_GUEST: u32 = 1 << 9;
const ENTRY_LOAD_IA32_EFER: u32 = 1 << 15;

const EXIT_HOST_ADDRESS_SPACE_SIZE: u32 = 1 << 9;
const EXIT_LOAD_IA32_EFER: u32 = 1 << 21;

const GUEST_CS_AR_CODE: u64 = 0xA09B;
const GUEST_DATA_AR: u64 = 0x4093;
const GUEST_TR_AR: u64 = 0x008B;
const GUEST_LDTR_AR: u64 = 0x0082;

const GUEST_RFLAGS_RESERVED: u64 = 0x2;

fn read_cr0() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr0", out(reg) value, options(nomem, nostack));
    }
    value
}

fn read_cr3() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack));
    }
    value
}

fn read_cr4() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr4", out(reg) value, options(nomem, nostack));
    }
    value
}

macro_rules! read_segment {
    ($name:ident, $reg:literal) => {
        fn $name() -> u16 {
            let value: u16;
            unsafe {
                asm!(concat!("mov {:x}, ", $reg), out(reg) value, options(nomem, nostack));
            }
            value
        }
    };
}

read_segment!(read_cs, "cs");
read_segment!(read_ss, "ss");
read_segment!(read_ds, "ds");
read_segment!(read_es, "es");
read_segment!(read_fs, "fs");
read_segment!(read_gs, "gs");

fn read_tr() -> u16 {
    let value: u16;
    unsafe {
        asm!("str {:x}", out(reg) value, options(nomem, nostack));
    }
    value
}

#[repr(C, packed)]
struct DtPtr {
    limit: u16,
    base: u64,
}

fn read_gdtr() -> DtPtr {
    let mut ptr = DtPtr { limit: 0, base: 0 };
    unsafe {
        asm!("sgdt [{}]", in(reg) &mut ptr, options(nostack));
    }
    ptr
}

fn read_idtr() -> DtPtr {
    let mut ptr = DtPtr { limit: 0, base: 0 };
    unsafe {
        asm!("sidt [{}]", in(reg) &mut ptr, options(nostack));
    }
    ptr
}

/// Adjusts a desired control value against the appropriate capability MSR, preferring the "TRUE"
/// variant when `IA32_VMX_BASIC` advertises it.
fn adjusted(desired: u32, legacy_msr: u32, true_msr: u32) -> u32 {
    let basic = msr::rdmsr64(msr::IA32_VMX_BASIC);
    let capability_msr = if basic & msr::VMX_BASIC_TRUE_CONTROLS != 0 {
        true_msr
    } else {
        legacy_msr
    };
    msr::adjust_controls(desired, msr::rdmsr64(capability_msr))
}

/// Writes the three control clusters the spec defines (pin, primary processor, entry, exit),
/// each reconciled against its capability MSR.
unsafe fn write_controls() -> Result<(), VmxError> {
    let pin = adjusted(
        PIN_BASED_NONE,
        msr::IA32_VMX_PINBASED_CTLS,
        msr::IA32_VMX_TRUE_PINBASED_CTLS,
    );
    let primary = adjusted(
        PRIMARY_HLT_EXITING,
        msr::IA32_VMX_PROCBASED_CTLS,
        msr::IA32_VMX_TRUE_PROCBASED_CTLS,
    );
    let entry = adjusted(
        ENTRY_IA32E_MODE_GUEST | ENTRY_LOAD_IA32_EFER,
        msr::IA32_VMX_ENTRY_CTLS,
        msr::IA32_VMX_TRUE_ENTRY_CTLS,
    );
    let exit = adjusted(
        EXIT_HOST_ADDRESS_SPACE_SIZE | EXIT_LOAD_IA32_EFER,
        msr::IA32_VMX_EXIT_CTLS,
        msr::IA32_VMX_TRUE_EXIT_CTLS,
    );

    unsafe {
        vmwrite(f::PIN_BASED_VM_EXEC_CONTROL, u64::from(pin))?;
        vmwrite(f::CPU_BASED_VM_EXEC_CONTROL, u64::from(primary))?;
        vmwrite(f::VM_ENTRY_CONTROLS, u64::from(entry))?;
        vmwrite(f::VM_EXIT_CONTROLS, u64::from(exit))?;
        vmwrite(f::EXCEPTION_BITMAP, 0)?;
    }

    Ok(())
}

/// Writes every host-state field. `host_tr_base` must be the TR descriptor's decoded base
/// address (see the kernel's GDT module), since decoding it requires knowing the GDT layout.
unsafe fn write_host_state(host_tr_base: u64) -> Result<(), VmxError> {
    let cr0 = read_cr0();
    let cr3 = read_cr3();
    let cr4 = read_cr4();
    let efer = msr::rdmsr64(msr::IA32_EFER);

    let cs = read_cs();
    let ss = read_ss();
    let ds = read_ds();
    let es = read_es();
    let fs = read_fs();
    let gs = read_gs();
    let tr = read_tr();

    let gdtr = read_gdtr();
    let idtr = read_idtr();

    let fs_base = msr::rdmsr64(msr::IA32_FS_BASE);
    let gs_base = msr::rdmsr64(msr::IA32_GS_BASE);

    let host_stack = pmm::get()
        .alloc_4k_aligned()
        .map_err(|_| VmxError::Unknown(0))?;
    let host_rsp = host_stack.phys2virt().0 as u64 + HOST_STACK_SIZE as u64;

    let host_rip = VirtAddr::from(asm_vmexit as *const ()).0 as u64;

    unsafe {
        vmwrite(f::HOST_CR0, cr0)?;
        vmwrite(f::HOST_CR3, cr3)?;
        vmwrite(f::HOST_CR4, cr4)?;

        vmwrite(f::HOST_ES_SELECTOR, u64::from(es & 0xFFF8))?;
        vmwrite(f::HOST_CS_SELECTOR, u64::from(cs & 0xFFF8))?;
        vmwrite(f::HOST_SS_SELECTOR, u64::from(ss & 0xFFF8))?;
        vmwrite(f::HOST_DS_SELECTOR, u64::from(ds & 0xFFF8))?;
        vmwrite(f::HOST_FS_SELECTOR, u64::from(fs & 0xFFF8))?;
        vmwrite(f::HOST_GS_SELECTOR, u64::from(gs & 0xFFF8))?;
        vmwrite(f::HOST_TR_SELECTOR, u64::from(tr & 0xFFF8))?;

        vmwrite(f::HOST_FS_BASE, fs_base)?;
        vmwrite(f::HOST_GS_BASE, gs_base)?;
        vmwrite(f::HOST_TR_BASE, host_tr_base)?;
        vmwrite(f::HOST_GDTR_BASE, gdtr.base)?;
        vmwrite(f::HOST_IDTR_BASE, idtr.base)?;

        vmwrite(f::HOST_IA32_EFER, efer)?;

        vmwrite(f::HOST_RSP, host_rsp)?;
        vmwrite(f::HOST_RIP, host_rip)?;
    }

    Ok(())
}

/// Writes every guest-state field. The guest shares the host's page tables and control register
/// state (no nested paging); `guest_entry` is where the guest starts executing, typically a
/// HLT-loop function.
unsafe fn write_guest_state(guest_entry: VirtAddr) -> Result<(), VmxError> {
    let cr0 = read_cr0();
    let cr3 = read_cr3();
    let cr4 = read_cr4();
    let efer = msr::rdmsr64(msr::IA32_EFER);
    let cs = read_cs();

    unsafe {
        vmwrite(f::GUEST_CR0, cr0)?;
        vmwrite(f::GUEST_CR3, cr3)?;
        vmwrite(f::GUEST_CR4, cr4)?;

        vmwrite(f::GUEST_CS_SELECTOR, u64::from(cs))?;
        vmwrite(f::GUEST_SS_SELECTOR, 0)?;
        vmwrite(f::GUEST_DS_SELECTOR, 0)?;
        vmwrite(f::GUEST_ES_SELECTOR, 0)?;
        vmwrite(f::GUEST_FS_SELECTOR, 0)?;
        vmwrite(f::GUEST_GS_SELECTOR, 0)?;
        vmwrite(f::GUEST_LDTR_SELECTOR, 0)?;
        vmwrite(f::GUEST_TR_SELECTOR, 0)?;

        vmwrite(f::GUEST_CS_LIMIT, 0xFFFF)?;
        vmwrite(f::GUEST_SS_LIMIT, 0xFFFF)?;
        vmwrite(f::GUEST_DS_LIMIT, 0xFFFF)?;
        vmwrite(f::GUEST_ES_LIMIT, 0xFFFF)?;
        vmwrite(f::GUEST_FS_LIMIT, 0xFFFF)?;
        vmwrite(f::GUEST_GS_LIMIT, 0xFFFF)?;
        vmwrite(f::GUEST_LDTR_LIMIT, 0)?;
        vmwrite(f::GUEST_TR_LIMIT, 0)?;
        vmwrite(f::GUEST_GDTR_LIMIT, 0)?;
        vmwrite(f::GUEST_IDTR_LIMIT, 0)?;

        vmwrite(f::GUEST_ES_BASE, 0)?;
        vmwrite(f::GUEST_CS_BASE, 0)?;
        vmwrite(f::GUEST_SS_BASE, 0)?;
        vmwrite(f::GUEST_DS_BASE, 0)?;
        vmwrite(f::GUEST_FS_BASE, 0)?;
        vmwrite(f::GUEST_GS_BASE, 0)?;
        vmwrite(f::GUEST_LDTR_BASE, 0)?;
        vmwrite(f::GUEST_TR_BASE, 0)?;
        vmwrite(f::GUEST_GDTR_BASE, 0)?;
        vmwrite(f::GUEST_IDTR_BASE, 0)?;

        vmwrite(f::GUEST_CS_AR_BYTES, GUEST_CS_AR_CODE)?;
        vmwrite(f::GUEST_SS_AR_BYTES, GUEST_DATA_AR)?;
        vmwrite(f::GUEST_DS_AR_BYTES, GUEST_DATA_AR)?;
        vmwrite(f::GUEST_ES_AR_BYTES, GUEST_DATA_AR)?;
        vmwrite(f::GUEST_FS_AR_BYTES, GUEST_DATA_AR)?;
        vmwrite(f::GUEST_GS_AR_BYTES, GUEST_DATA_AR)?;
        vmwrite(f::GUEST_TR_AR_BYTES, GUEST_TR_AR)?;
        vmwrite(f::GUEST_LDTR_AR_BYTES, GUEST_LDTR_AR)?;

        vmwrite(f::GUEST_RIP, guest_entry.0 as u64)?;
        vmwrite(f::GUEST_RSP, 0)?;
        vmwrite(f::GUEST_RFLAGS, GUEST_RFLAGS_RESERVED)?;

        vmwrite(f::GUEST_IA32_EFER, efer)?;
        vmwrite(f::VMCS_LINK_POINTER, 0xFFFF_FFFF_FFFF_FFFF)?;
    }

    Ok(())
}

/// Builds the full VMCS content: controls, host state, guest state. The VMCS named by `vmcs`
/// must already be current-and-active (`VmcsRegion::load` called).
///
/// # Safety
/// A VMCS must be current; `host_tr_base` must be the caller's actual decoded TR base.
pub unsafe fn build(guest_entry: VirtAddr, host_tr_base: u64) -> Result<(), VmxError> {
    unsafe {
        write_controls()?;
        write_host_state(host_tr_base)?;
        write_guest_state(guest_entry)?;
    }

    logger::log_info!("VMCS built: guest entry at {:#x}", guest_entry.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[macros::test_fn]
    fn test_adjusted_prefers_true_controls_when_advertised() {
        // Not meaningfully testable without mocking rdmsr; the fixed-point property itself is
        // covered in `msr::tests`. This just checks selector masking keeps RPL/TI bits clear.
        let masked: u64 = u64::from(0x1Bu16 & 0xFFF8);
        assert_eq!(masked, 0x18);
    }

    #[macros::test_fn]
    fn test_dtptr_layout() {
        assert_eq!(size_of::<DtPtr>(), 10);
    }
}
