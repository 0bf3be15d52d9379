//! The panic handler: logs the message, walks the frame-pointer chain for a backtrace, and
//! halts. Guards against a panic occurring while already unwinding a panic.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::cpu;

const MAX_FRAMES: usize = 64;

static PANICKING: AtomicBool = AtomicBool::new(false);

/// Whether `addr` could plausibly be a return address worth dereferencing: canonical (bits
/// 48-63 are a sign-extension of bit 47) and 8-byte aligned. Guards the frame-pointer walk
/// against wandering into garbage once a corrupted `rbp` chain is encountered.
fn looks_like_code_address(addr: u64) -> bool {
    if addr % 8 != 0 {
        return false;
    }
    let sign_extension = addr >> 47;
    sign_extension == 0 || sign_extension == 0x1_FFFF
}

/// Walks up to `MAX_FRAMES` return addresses starting from the current `rbp`, logging each.
fn backtrace() {
    let mut rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nostack, nomem));
    }

    logger::log_err!("backtrace:");
    for depth in 0..MAX_FRAMES {
        if !looks_like_code_address(rbp) {
            break;
        }

        let frame = rbp as *const u64;
        let (saved_rbp, return_addr) = unsafe { (frame.read(), frame.add(1).read()) };

        if !looks_like_code_address(return_addr) {
            break;
        }

        logger::log_err!("  #{depth} {:#018x}", return_addr);
        rbp = saved_rbp;
    }
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    cpu::cli();

    if PANICKING.swap(true, Ordering::SeqCst) {
        logger::log_err!("panic during panic: {}", info);
        crate::arch::x86_64::hcf();
    }

    logger::log_err!("{}", info);
    backtrace();
    crate::arch::x86_64::hcf();
}
