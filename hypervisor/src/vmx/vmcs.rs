//! VMCS region lifecycle and the `vmread`/`vmwrite` accessor pair.
//!
//! A single 64-bit accessor pair is kept for every field width (matching the teacher's own
//! VMX-adjacent `svm` module, which likewise exposes uniform accessors over its control-area
//! fields) — natural-width fields dominate VMCS traffic on this architecture, so callers
//! truncate/widen at the call site rather than paying for a width-typed API.

use core::arch::asm;

use pmm::PmmAllocator;
use utils::mem::PhysAddr;

use super::fields::Field;
use super::msr;

/// A decoded `VM_INSTRUCTION_ERROR` value, for the 26 architecturally defined error numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// VMCALL executed in VMX root operation
    VmcallInRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearInvalidAddress = 2,
    /// VMCLEAR with VMXON pointer
    VmclearVmxonPointer = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchNonClearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeNonLaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    VmEntryInvalidControlFields = 7,
    /// VM entry with invalid host-state field(s)
    VmEntryInvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmptrldInvalidAddress = 9,
    /// VMPTRLD with VMXON pointer
    VmptrldVmxonPointer = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmptrldBadRevision = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedComponent = 12,
    /// VMWRITE to read-only VMCS component
    VmwriteReadOnly = 13,
    /// VMXON executed in VMX root operation
    VmxonInRoot = 15,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryInvalidExecutiveVmcs = 16,
    /// VM entry with non-launched executive VMCS
    VmEntryNonLaunchedExecutiveVmcs = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryExecutiveVmcsNotVmxonPointer = 18,
    /// VMCALL with non-clear VMCS
    VmcallNonClearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields
    VmcallInvalidExitControls = 20,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallBadMsegRevision = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffDualMonitor = 23,
    /// VMCALL with invalid SMM-monitor features
    VmcallInvalidSmmFeatures = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmEntryInvalidExecutiveControls = 25,
    /// VM entry with events blocked by MOV SS
    VmEntryMovSsBlocking = 26,
    /// Invalid operand to INVEPT/INVVPID
    InvalidInveptInvvpidOperand = 28,
    /// Failure not decoded to a known mnemonic
    Unknown(u64),
}

impl VmxError {
    pub(crate) fn from_code(code: u64) -> Self {
        match code {
            1 => Self::VmcallInRoot,
            2 => Self::VmclearInvalidAddress,
            3 => Self::VmclearVmxonPointer,
            4 => Self::VmlaunchNonClearVmcs,
            5 => Self::VmresumeNonLaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::VmEntryInvalidControlFields,
            8 => Self::VmEntryInvalidHostState,
            9 => Self::VmptrldInvalidAddress,
            10 => Self::VmptrldVmxonPointer,
            11 => Self::VmptrldBadRevision,
            12 => Self::UnsupportedComponent,
            13 => Self::VmwriteReadOnly,
            15 => Self::VmxonInRoot,
            16 => Self::VmEntryInvalidExecutiveVmcs,
            17 => Self::VmEntryNonLaunchedExecutiveVmcs,
            18 => Self::VmEntryExecutiveVmcsNotVmxonPointer,
            19 => Self::VmcallNonClearVmcs,
            20 => Self::VmcallInvalidExitControls,
            22 => Self::VmcallBadMsegRevision,
            23 => Self::VmxoffDualMonitor,
            24 => Self::VmcallInvalidSmmFeatures,
            25 => Self::VmEntryInvalidExecutiveControls,
            26 => Self::VmEntryMovSsBlocking,
            28 => Self::InvalidInveptInvvpidOperand,
            other => Self::Unknown(other),
        }
    }
}

/// Reads `VM_INSTRUCTION_ERROR` after a failed VMX instruction and decodes it.
///
/// # Safety
/// Only meaningful immediately after a VMX instruction failed with CF or ZF set, and only when a
/// VMCS is current (VMXON alone does not set `VM_INSTRUCTION_ERROR`).
unsafe fn read_instruction_error() -> VmxError {
    let code = unsafe { vmread_raw(u64::from(super::fields::VM_INSTRUCTION_ERROR)) }.unwrap_or(0);
    VmxError::from_code(code)
}

unsafe fn vmread_raw(field: u64) -> Result<u64, VmxError> {
    let value: u64;
    let rflags: u64;
    unsafe {
        asm!(
            "vmread {value}, {field}",
            "pushfq",
            "pop {rflags}",
            field = in(reg) field,
            value = out(reg) value,
            rflags = out(reg) rflags,
        );
    }

    if rflags & 0x1 != 0 || rflags & 0x40 != 0 {
        return Err(VmxError::Unknown(0));
    }

    Ok(value)
}

/// Reads a VMCS field by its encoding. The VMCS identified by the most recent successful
/// `VMPTRLD` must still be current.
///
/// # Safety
/// A VMCS must be current (`VMPTRLD` succeeded and no intervening `VMCLEAR` ran).
pub unsafe fn vmread(field: Field) -> Result<u64, VmxError> {
    match unsafe { vmread_raw(u64::from(field)) } {
        Ok(v) => Ok(v),
        Err(_) => Err(unsafe { read_instruction_error() }),
    }
}

/// Writes a VMCS field by its encoding.
///
/// # Safety
/// A VMCS must be current.
pub unsafe fn vmwrite(field: Field, value: u64) -> Result<(), VmxError> {
    let rflags: u64;
    unsafe {
        asm!(
            "vmwrite {field}, {value}",
            "pushfq",
            "pop {rflags}",
            field = in(reg) u64::from(field),
            value = in(reg) value,
            rflags = out(reg) rflags,
        );
    }

    if rflags & 0x1 != 0 || rflags & 0x40 != 0 {
        return Err(unsafe { read_instruction_error() });
    }

    Ok(())
}

/// Executes `VMCLEAR` on the given VMCS region.
///
/// # Safety
/// `phys` must be a 4 KiB-aligned physical address of a region previously allocated for use as
/// a VMCS.
pub unsafe fn vmclear(phys: PhysAddr) -> Result<(), VmxError> {
    let addr = phys.0 as u64;
    let rflags: u64;
    unsafe {
        asm!(
            "vmclear [{addr}]",
            "pushfq",
            "pop {rflags}",
            addr = in(reg) &addr,
            rflags = out(reg) rflags,
        );
    }

    if rflags & 0x1 != 0 || rflags & 0x40 != 0 {
        return Err(VmxError::Unknown(0));
    }
    Ok(())
}

/// Executes `VMPTRLD` to make the given region the current-and-active VMCS.
///
/// # Safety
/// `phys` must reference a region already initialized with `VMCLEAR`.
pub unsafe fn vmptrld(phys: PhysAddr) -> Result<(), VmxError> {
    let addr = phys.0 as u64;
    let rflags: u64;
    unsafe {
        asm!(
            "vmptrld [{addr}]",
            "pushfq",
            "pop {rflags}",
            addr = in(reg) &addr,
            rflags = out(reg) rflags,
        );
    }

    if rflags & 0x1 != 0 || rflags & 0x40 != 0 {
        return Err(VmxError::Unknown(0));
    }
    Ok(())
}

/// A 4 KiB VMCS region: allocates a physical frame, zeroes it, stamps the VMCS revision
/// identifier from `IA32_VMX_BASIC`, and leaves it cleared (not yet current).
pub struct VmcsRegion {
    phys: PhysAddr,
}

impl VmcsRegion {
    /// Allocates and VMCLEARs a fresh VMCS region.
    ///
    /// # Safety
    /// Must run after VMX root operation has been entered (VMXON succeeded).
    pub unsafe fn new() -> Result<Self, VmxError> {
        let phys = pmm::get()
            .alloc_4k_aligned()
            .map_err(|_| VmxError::Unknown(0))?;

        let virt = phys.phys2virt();
        let ptr: *mut u32 = virt.into();
        unsafe {
            core::ptr::write_bytes(ptr.cast::<u8>(), 0, pmm::BASIC_PAGE_SIZE);

            let revision_id = msr::rdmsr64(msr::IA32_VMX_BASIC) as u32 & 0x7FFF_FFFF;
            ptr.write(revision_id);

            vmclear(phys)?;
        }

        Ok(Self { phys })
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// Makes this region the current-and-active VMCS.
    ///
    /// # Safety
    /// Must have been VMCLEARed (fresh or explicitly cleared) before this call.
    pub unsafe fn load(&self) -> Result<(), VmxError> {
        unsafe { vmptrld(self.phys) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[macros::test_fn]
    fn test_vmx_error_decode_known_codes() {
        assert_eq!(VmxError::from_code(7), VmxError::VmEntryInvalidControlFields);
        assert_eq!(VmxError::from_code(13), VmxError::VmwriteReadOnly);
        assert!(matches!(VmxError::from_code(99), VmxError::Unknown(99)));
    }
}
