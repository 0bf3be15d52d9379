//! Physical Memory Manager (PMM): a bitmap frame allocator fed by the firmware memory map.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::cast_possible_truncation)]

use utils::mem::PhysAddr;
use utils::sync::spinlock::SpinLockGuard;

extern crate alloc;

#[cfg(feature = "pmm_bump")]
mod bump;

pub const BASIC_PAGE_SIZE: usize = 0x1000;

/// Physical memory covered by the allocator's bitmap. 128 GiB, per the data model.
pub const MAX_COVERED_BYTES: usize = 128 * 1024 * 1024 * 1024;
pub const MAX_COVERED_FRAMES: usize = MAX_COVERED_BYTES / BASIC_PAGE_SIZE;

/// Firmware memory-region classification, decoded from the raw UEFI-style descriptor by the
/// kernel's boot glue (which alone knows `descriptor_size` and must never assume
/// `sizeof(MemoryDescriptor)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Reserved,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    Conventional,
    Unusable,
    AcpiReclaim,
    AcpiNvs,
    MemoryMappedIo,
    MemoryMappedIoPortSpace,
    PalCode,
    Persistent,
    Other,
}

/// A single decoded memory-map entry.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub typ: MemoryType,
    pub phys_start: PhysAddr,
    pub page_count: usize,
}

/// Errors that the PMM might encounter
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum PmmError {
    /// The requested block lies (partly) outside `[frame_begin, frame_end)`
    OutOfBounds,
    /// No available contiguous run of the requested size
    NoAvailableBlock,
    /// The requested block is already free
    FreeOfAlreadyFree,
    /// The requested alignment is invalid (zero, or not a power of two)
    InvalidAlignment,
    /// The requested address is not frame (4 KiB) aligned
    InvalidAddress,
}

/// Get the active PMM singleton, locked.
pub fn get<'a>() -> SpinLockGuard<'a, impl PmmAllocator> {
    #[cfg(feature = "pmm_bump")]
    {
        bump::BUMP_ALLOCATOR.lock()
    }
}

/// Initialize the active PMM from a decoded firmware memory map.
///
/// # Safety
/// Must be called exactly once, before any allocation, and while addressing is still identity
/// mapped (i.e. before the paging engine installs the direct map).
pub unsafe fn init(mem_map: &[MemoryDescriptor]) {
    #[cfg(feature = "pmm_bump")]
    unsafe {
        bump::BumpAllocator::init(mem_map);
    }

    logger::log_info!("PMM initialized successfully");
}

/// Marks `BootServicesData` frames as free. Must run only after the paging engine has finished
/// reading the loader's tables, since those tables may live in a `BootServicesData` region.
pub fn release_boot_services_data(mem_map: &[MemoryDescriptor]) {
    #[cfg(feature = "pmm_bump")]
    bump::BumpAllocator::release_boot_services_data(mem_map);
}

pub trait PmmAllocator: utils::sync::spinlock::SpinLockable {
    /// Allocates a physically contiguous run of `page_count` 4 KiB frames whose first frame
    /// number is a multiple of `alignment` (in frame granularity: 1 for 4 KiB, 2 for 8 KiB, ...).
    fn alloc_pages(&mut self, alignment: usize, page_count: usize) -> Result<PhysAddr, PmmError>;

    /// Allocates a single 4 KiB frame with no alignment constraint beyond the frame size itself.
    fn alloc_4k_aligned(&mut self) -> Result<PhysAddr, PmmError> {
        self.alloc_pages(1, 1)
    }

    /// Allocates exactly the frames backing `addr..addr+page_count*4096`.
    fn alloc_at(&mut self, addr: PhysAddr, page_count: usize) -> Result<(), PmmError>;

    /// Frees a previously allocated contiguous run.
    ///
    /// # Safety
    /// `addr`/`page_count` must describe a run that was returned by a prior allocation and not
    /// yet freed.
    unsafe fn free(&mut self, addr: PhysAddr, page_count: usize) -> Result<(), PmmError>;

    /// Returns whether every frame in the run is currently unused.
    fn is_page_free(&self, addr: PhysAddr, page_count: usize) -> Result<bool, PmmError>;
}

/// Convert a frame number to its physical address.
#[inline]
pub const fn frame_id_to_addr(id: usize) -> usize {
    id * BASIC_PAGE_SIZE
}

/// Convert a physical address to its frame number. `None` if misaligned.
#[inline]
pub fn addr_to_frame_id(addr: usize) -> Option<usize> {
    if addr % BASIC_PAGE_SIZE != 0 {
        return None;
    }
    Some(addr / BASIC_PAGE_SIZE)
}
