//! The UEFI loader hand-off contract: `BootInfo`, the raw firmware memory map, and the kernel
//! entry point itself.

use core::arch::asm;

use pmm::{MemoryDescriptor, MemoryType};
use utils::mem::PhysAddr;

/// Magic value the loader stamps at the head of `BootInfo`, checked before anything else runs.
pub const BOOT_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Hand-off structure built by the UEFI-side loader and passed as the first argument to the
/// kernel entry point.
#[repr(C)]
pub struct BootInfo {
    pub magic: u64,
    pub memory_map: RawMemoryMap,
}

/// The firmware memory map as the loader describes it: a byte buffer of `map_size` bytes holding
/// back-to-back descriptors each `descriptor_size` bytes apart (never assume this equals
/// `size_of::<RawMemoryDescriptor>()` — the firmware may have appended vendor-specific fields).
#[repr(C)]
pub struct RawMemoryMap {
    pub buffer_size: u64,
    pub descriptors: *const u8,
    pub map_size: u64,
    pub map_key: u64,
    pub descriptor_size: u64,
    pub descriptor_version: u32,
}

/// A single raw, packed firmware memory descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RawMemoryDescriptor {
    pub typ: u32,
    pub pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

fn decode_type(raw: u32) -> MemoryType {
    match raw {
        0 => MemoryType::Reserved,
        1 => MemoryType::LoaderCode,
        2 => MemoryType::LoaderData,
        3 => MemoryType::BootServicesCode,
        4 => MemoryType::BootServicesData,
        5 => MemoryType::RuntimeServicesCode,
        6 => MemoryType::RuntimeServicesData,
        7 => MemoryType::Conventional,
        8 => MemoryType::Unusable,
        9 => MemoryType::AcpiReclaim,
        10 => MemoryType::AcpiNvs,
        11 => MemoryType::MemoryMappedIo,
        12 => MemoryType::MemoryMappedIoPortSpace,
        13 => MemoryType::PalCode,
        14 => MemoryType::Persistent,
        _ => MemoryType::Other,
    }
}

/// Walks the raw, strided firmware memory map and decodes each entry, respecting
/// `descriptor_size` rather than `size_of::<RawMemoryDescriptor>()`.
///
/// # Safety
/// `map` must describe a valid, readable region of `map.map_size` bytes at `map.descriptors`,
/// each `map.descriptor_size` bytes apart, each at least `size_of::<RawMemoryDescriptor>()`.
pub unsafe fn decode_memory_map(
    map: &RawMemoryMap,
    out: &mut [MemoryDescriptor],
) -> usize {
    let stride = map.descriptor_size as usize;
    let count = (map.map_size as usize / stride).min(out.len());

    for (i, slot) in out.iter_mut().enumerate().take(count) {
        let entry_ptr = unsafe { map.descriptors.add(i * stride) }.cast::<RawMemoryDescriptor>();
        let entry = unsafe { entry_ptr.read_unaligned() };

        *slot = MemoryDescriptor {
            typ: decode_type(entry.typ),
            phys_start: PhysAddr(entry.physical_start as usize),
            page_count: entry.number_of_pages as usize,
        };
    }

    count
}

unsafe extern "C" {
    /// Linker-provided top of the initial kernel stack; 16-byte aligned so the callee's
    /// prologue observes the SysV ABI's required alignment.
    static __stack_top: u8;
}

/// Entry point invoked by the loader with `rdi = &BootInfo`. Switches onto the linker-provided
/// stack and calls into `kmain`.
///
/// # Safety
/// Must be the very first code to run; must be invoked with a valid `BootInfo` pointer.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "lea rsp, [rip + {stack_top}]",
        "and rsp, -16",
        "call {kmain}",
        stack_top = sym __stack_top,
        kmain = sym crate::kmain,
    );
}
