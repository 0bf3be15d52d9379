//! Intel VMX hypervisor core: enter VMX root operation, build a VMCS, and run a guest through
//! VM-exits.
//!
//! This crate knows nothing about the kernel crate that embeds it — the one piece of host state
//! it cannot derive on its own (the TR descriptor's base address, which depends on the caller's
//! GDT layout) is passed in by the caller.

#![cfg_attr(not(test), no_std)]

pub mod vmx;

use utils::mem::VirtAddr;
use vmx::vcpu::GuestRegisters;
use vmx::vmcs::{VmcsRegion, VmxError};

/// Enters VMX root operation, builds a single VMCS for `guest_entry`, and runs it until an
/// unimplemented exit reason or a VM-entry failure halts the loop.
///
/// `host_tr_base` is the caller's decoded TR descriptor base (see the kernel's
/// `arch::x86_64::gdt::decode_tss_base`).
///
/// # Safety
/// Must run once, after the caller has confirmed an Intel CPU and finished all paging/GDT/IDT
/// setup it wants visible to the guest (the guest shares the host's CR3).
pub unsafe fn run_guest(guest_entry: VirtAddr, host_tr_base: u64) -> VmxError {
    unsafe {
        let _vmxon = match vmx::enter_root_operation() {
            Ok(region) => region,
            Err(e) => return e,
        };

        let vmcs = match VmcsRegion::new() {
            Ok(v) => v,
            Err(e) => return e,
        };

        if let Err(e) = vmcs.load() {
            return e;
        }
        if let Err(e) = vmx::builder::build(guest_entry, host_tr_base) {
            return e;
        }

        let mut guest_regs = GuestRegisters::default();
        vmx::vcpu::run(&vmcs, &mut guest_regs)
    }
}
