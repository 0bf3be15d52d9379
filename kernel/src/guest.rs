//! The hypervisor's only tenant: a minimal payload proving VM-entry/exit round-trips through the
//! exact path a real guest would take.
//!
//! The guest shares the host's CR0/CR3/CR4/GDT (see `SPEC_FULL.md`'s no-EPT non-goal), so this is
//! just host code executed in VMX non-root operation rather than a separately mapped image.

/// Halts in a loop. Every `hlt` traps to the host (`PRIMARY_HLT_EXITING` is always set), which
/// advances `GUEST_RIP` past it and resumes — proving the control loop rather than doing
/// anything useful.
#[unsafe(no_mangle)]
pub extern "C" fn guest_entry() -> ! {
    loop {
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}
