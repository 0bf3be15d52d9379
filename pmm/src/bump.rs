//! A bump-style bitmap frame allocator: one bit per 4 KiB frame, no coalescing or compaction.

use utils::mem::PhysAddr;
use utils::sync::spinlock::{SpinLock, SpinLockable};

use super::{MAX_COVERED_FRAMES, MemoryDescriptor, MemoryType, PmmAllocator, PmmError};

const BITMAP_BYTES: usize = MAX_COVERED_FRAMES / 8;

const FREE: bool = false;
const USED: bool = true;

pub(super) static BUMP_ALLOCATOR: SpinLock<BumpAllocator> = SpinLock::new(BumpAllocator::uninit());

pub(super) struct BumpAllocator {
    bitmap: [u8; BITMAP_BYTES],
    /// First frame number the allocator may ever hand out.
    frame_begin: usize,
    /// One past the last frame number the allocator may ever hand out.
    frame_end: usize,
}

impl SpinLockable for BumpAllocator {}

impl BumpAllocator {
    const fn uninit() -> Self {
        Self {
            bitmap: [0; BITMAP_BYTES],
            frame_begin: 0,
            frame_end: 0,
        }
    }

    fn get(&self, id: usize) -> bool {
        (self.bitmap[id / 8] & (1 << (id % 8))) != 0
    }

    fn set(&mut self, id: usize, used: bool) {
        if used {
            self.bitmap[id / 8] |= 1 << (id % 8);
        } else {
            self.bitmap[id / 8] &= !(1 << (id % 8));
        }
    }

    fn mark_range(&mut self, base_frame: usize, frame_count: usize, used: bool) {
        for id in base_frame..(base_frame + frame_count) {
            if id < self.frame_end {
                self.set(id, used);
            }
        }
    }

    /// # Safety
    /// Called once, before any allocation, while addressing is still identity-mapped.
    pub(super) unsafe fn init(mem_map: &[MemoryDescriptor]) {
        #[allow(static_mut_refs)]
        let mut allocator = BUMP_ALLOCATOR.lock();

        // Frame 0 is permanently reserved, and everything starts out USED until proven
        // conventional memory below.
        allocator.frame_begin = 1;
        allocator.frame_end = mem_map
            .iter()
            .map(|d| (d.phys_start.0 / super::BASIC_PAGE_SIZE) + d.page_count)
            .max()
            .unwrap_or(0)
            .min(MAX_COVERED_FRAMES);

        for byte in allocator.bitmap.iter_mut() {
            *byte = 0xFF;
        }

        for descr in mem_map {
            if matches!(
                descr.typ,
                MemoryType::Conventional | MemoryType::BootServicesCode
            ) {
                let base_frame = descr.phys_start.0 / super::BASIC_PAGE_SIZE;
                allocator.mark_range(base_frame, descr.page_count, FREE);
            }
        }

        // Frame 0 is reserved unconditionally, even if the map claims it's conventional.
        allocator.set(0, USED);
    }

    pub(super) fn release_boot_services_data(mem_map: &[MemoryDescriptor]) {
        let mut allocator = BUMP_ALLOCATOR.lock();
        for descr in mem_map {
            if descr.typ == MemoryType::BootServicesData {
                let base_frame = descr.phys_start.0 / super::BASIC_PAGE_SIZE;
                allocator.mark_range(base_frame, descr.page_count, FREE);
            }
        }
    }
}

impl PmmAllocator for BumpAllocator {
    fn alloc_pages(&mut self, alignment: usize, page_count: usize) -> Result<PhysAddr, PmmError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(PmmError::InvalidAlignment);
        }

        'candidates: for base in (self.frame_begin..self.frame_end).step_by(alignment) {
            if base + page_count > self.frame_end {
                break;
            }

            for id in base..(base + page_count) {
                if self.get(id) == USED {
                    continue 'candidates;
                }
            }

            self.mark_range(base, page_count, USED);
            return Ok(PhysAddr(super::frame_id_to_addr(base)));
        }

        Err(PmmError::NoAvailableBlock)
    }

    fn alloc_at(&mut self, addr: PhysAddr, page_count: usize) -> Result<(), PmmError> {
        let base = super::addr_to_frame_id(addr.0).ok_or(PmmError::InvalidAddress)?;

        if base + page_count > self.frame_end {
            return Err(PmmError::OutOfBounds);
        }

        for id in base..(base + page_count) {
            if self.get(id) == USED {
                return Err(PmmError::NoAvailableBlock);
            }
        }

        self.mark_range(base, page_count, USED);
        Ok(())
    }

    unsafe fn free(&mut self, addr: PhysAddr, page_count: usize) -> Result<(), PmmError> {
        let base = super::addr_to_frame_id(addr.0).ok_or(PmmError::InvalidAddress)?;

        if base + page_count > self.frame_end {
            return Err(PmmError::OutOfBounds);
        }

        for id in base..(base + page_count) {
            if self.get(id) == FREE {
                return Err(PmmError::FreeOfAlreadyFree);
            }
        }

        self.mark_range(base, page_count, FREE);
        Ok(())
    }

    fn is_page_free(&self, addr: PhysAddr, page_count: usize) -> Result<bool, PmmError> {
        let base = super::addr_to_frame_id(addr.0).ok_or(PmmError::InvalidAddress)?;

        if base + page_count > self.frame_end {
            return Err(PmmError::OutOfBounds);
        }

        Ok((base..(base + page_count)).all(|id| self.get(id) == FREE))
    }
}

#[cfg(test)]
mod tests {
    use macros::test_fn;

    use super::*;

    fn make_map() -> [MemoryDescriptor; 1] {
        [MemoryDescriptor {
            typ: MemoryType::Conventional,
            phys_start: PhysAddr(0x100000),
            page_count: 16,
        }]
    }

    #[test_fn]
    fn test_init_from_map_s1() {
        let map = make_map();
        unsafe { BumpAllocator::init(&map) };

        let allocator = BUMP_ALLOCATOR.lock();
        assert_eq!(allocator.frame_end, 0x110);
        for id in 0x100..0x110 {
            assert_eq!(allocator.get(id), FREE);
        }
        assert_eq!(allocator.get(0), USED);
        assert_eq!(allocator.get(0x0ff), USED);
    }

    #[test_fn]
    fn test_alloc_pages_sequencing_s2() {
        let map = make_map();
        unsafe { BumpAllocator::init(&map) };

        let mut allocator = BUMP_ALLOCATOR.lock();
        let first = allocator.alloc_pages(1, 4).unwrap();
        assert_eq!(first.0, 0x100000);

        let second = allocator.alloc_pages(1, 4).unwrap();
        assert_eq!(second.0, 0x104000);

        unsafe { allocator.free(first, 4).unwrap() };

        let third = allocator.alloc_pages(1, 4).unwrap();
        assert_eq!(third.0, 0x100000);
    }

    #[test_fn]
    fn test_double_free_is_rejected() {
        let map = make_map();
        unsafe { BumpAllocator::init(&map) };

        let mut allocator = BUMP_ALLOCATOR.lock();
        let addr = allocator.alloc_pages(1, 2).unwrap();
        unsafe { allocator.free(addr, 2).unwrap() };
        unsafe {
            assert_eq!(allocator.free(addr, 2), Err(PmmError::FreeOfAlreadyFree));
        }
    }

    #[test_fn]
    fn test_exhaustion() {
        let map = make_map();
        unsafe { BumpAllocator::init(&map) };

        let mut allocator = BUMP_ALLOCATOR.lock();
        assert!(allocator.alloc_pages(1, 17).is_err());
    }
}
