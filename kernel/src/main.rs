#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(clippy::cast_possible_truncation)]

use pmm::{MemoryDescriptor, MemoryType};
use utils::mem::{PhysAddr, VirtAddr};

mod arch;
mod boot;
mod guest;
mod panic;
#[cfg(test)]
mod test;

use boot::BootInfo;

/// Firmware memory maps observed in practice run well under a hundred entries; this is a
/// generous ceiling with no dynamic allocation involved.
const MAX_MEMORY_MAP_ENTRIES: usize = 256;

const EMPTY_DESCRIPTOR: MemoryDescriptor = MemoryDescriptor {
    typ: MemoryType::Reserved,
    phys_start: PhysAddr(0),
    page_count: 0,
};

/// The kernel entry point, called by `boot::_start` with `rdi` already holding `&BootInfo` and
/// the stack switched onto the linker-provided initial stack.
///
/// # Safety
/// Must be invoked exactly once, by `_start`, with a `BootInfo` built by the loader.
#[unsafe(no_mangle)]
pub extern "C" fn kmain(boot_info: &BootInfo) -> ! {
    assert_eq!(boot_info.magic, boot::BOOT_MAGIC, "bad BootInfo magic");

    let mut mem_map = [EMPTY_DESCRIPTOR; MAX_MEMORY_MAP_ENTRIES];
    let count = unsafe { boot::decode_memory_map(&boot_info.memory_map, &mut mem_map) };
    let mem_map = &mem_map[..count];

    unsafe {
        pmm::init(mem_map);
        arch::x86_64::paging::rebuild().expect("paging rebuild failed");
    }
    pmm::release_boot_services_data(mem_map);

    unsafe {
        arch::x86_64::gdt::init();
        arch::x86_64::interrupts::init();
    }
    arch::x86_64::cpu::sti();

    arch::x86_64::require_intel();

    #[cfg(test)]
    test_main();

    logger::log_info!("entering VMX root operation");

    let host_tr_base = arch::x86_64::gdt::decode_tss_base(arch::x86_64::gdt::TSS_SEL);
    let guest_entry = VirtAddr(guest::guest_entry as usize);

    let err = unsafe { hypervisor::run_guest(guest_entry, host_tr_base) };
    logger::log_err!("hypervisor stopped: {:?}", err);

    arch::x86_64::hcf();
}
