//! Level-4 paging reconstruction: a 512 GiB direct map plus a clone of the loader's upper-half
//! kernel image.
//!
//! Before `rebuild` runs, the loader's identity mapping is still live, so `PhysAddr`/`VirtAddr`
//! translate as the identity function (see `utils::mem::TRANSLATION_READY`). `rebuild` must run
//! exactly once, and only after the PMM and the decoded memory map are no longer needed from
//! low-half loader state — see `boot::decode_memory_map`.

#[cfg(all(feature = "paging_4", feature = "paging_5"))]
compile_error!("`paging_4` and `paging_5` are mutually exclusive");

#[cfg(not(any(feature = "paging_4", feature = "paging_5")))]
compile_error!("one of `paging_4` or `paging_5` must be enabled");

use core::arch::asm;

use pmm::PmmAllocator;
use utils::mem::{DIRECT_MAP_BASE, KERNEL_BASE, PhysAddr, VirtAddr, mark_translation_ready};

const ENTRIES_PER_TABLE: usize = 512;
const GIB: usize = 1024 * 1024 * 1024;
const DIRECT_MAP_GIB: usize = 512;

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const ACCESSED: u64 = 1 << 5;
const PAGE_SIZE_BIT: u64 = 1 << 7;
const GLOBAL: u64 = 1 << 8;
const NO_EXECUTE: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    OutOfMemory,
}

/// One level-4/3/2/1 page table: 512 raw 64-bit entries.
#[repr(C, align(4096))]
struct Table([u64; ENTRIES_PER_TABLE]);

impl Table {
    fn entry_present(&self, i: usize) -> bool {
        self.0[i] & PRESENT != 0
    }

    fn entry_is_large(&self, i: usize) -> bool {
        self.0[i] & PAGE_SIZE_BIT != 0
    }

    fn entry_addr(&self, i: usize) -> PhysAddr {
        PhysAddr((self.0[i] & ADDR_MASK) as usize)
    }
}

/// Before the direct map exists, the loader's tables are still identity mapped; after, they are
/// reachable through it. `phys2virt` returns the identity translation until the one-shot latch
/// fires, so this is correct on both sides of `rebuild`.
fn phys2table(phys: PhysAddr) -> *mut Table {
    let virt: VirtAddr = phys.phys2virt();
    VirtAddr::into(virt)
}

fn alloc_table() -> Result<PhysAddr, PagingError> {
    let phys = pmm::get()
        .alloc_4k_aligned()
        .map_err(|_| PagingError::OutOfMemory)?;

    unsafe {
        core::ptr::write_bytes(phys2table(phys), 0, 1);
    }

    Ok(phys)
}

/// Recursively clones a present subtree rooted at `src`, `level` levels below the level-4 table
/// (3 = PDPT, 2 = PD, 1 = PT).
///
/// Large-page entries are copied verbatim (shared by value, never by table). Level-1 tables are
/// copied wholesale with no further recursion, since their entries are always 4 KiB leaves.
fn clone_subtree(src: &Table, level: usize) -> Result<PhysAddr, PagingError> {
    let dst_phys = alloc_table()?;
    let dst = unsafe { &mut *phys2table(dst_phys) };

    for i in 0..ENTRIES_PER_TABLE {
        if !src.entry_present(i) {
            continue;
        }

        if level == 1 || src.entry_is_large(i) {
            dst.0[i] = src.0[i];
            continue;
        }

        let child_src_phys = src.entry_addr(i);
        let child_src = unsafe { &*phys2table(child_src_phys) };
        let child_dst_phys = clone_subtree(child_src, level - 1)?;

        let flags = src.0[i] & !ADDR_MASK;
        dst.0[i] = (child_dst_phys.0 as u64 & ADDR_MASK) | flags;
    }

    Ok(dst_phys)
}

fn current_pml4() -> PhysAddr {
    let cr3: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nostack, nomem));
    }

    PhysAddr((cr3 & ADDR_MASK) as usize)
}

fn load_cr3(phys: PhysAddr) {
    unsafe {
        asm!("mov cr3, {}", in(reg) phys.0 as u64, options(nostack));
    }
}

/// Rebuilds the level-4 tree: a 512 GiB 1-GiB-page direct map, plus a clone of every
/// upper-half (strictly above the direct map's own index) entry the loader's table has present.
///
/// # Safety
/// Must run exactly once, after the PMM is initialized and after all loader-provided state
/// (`BootInfo`, the decoded memory map) has been copied out of low memory, since installing the
/// new CR3 leaves the loader's identity-mapped low half unreachable.
pub unsafe fn rebuild() -> Result<(), PagingError> {
    let new_pml4_phys = alloc_table()?;
    let new_pml4 = unsafe { &mut *phys2table(new_pml4_phys) };

    let direct_map_index = VirtAddr(DIRECT_MAP_BASE).next_level_index(3);

    let pdpt_phys = alloc_table()?;
    let pdpt = unsafe { &mut *phys2table(pdpt_phys) };
    for i in 0..DIRECT_MAP_GIB {
        let phys = (i * GIB) as u64;
        pdpt.0[i] =
            (phys & ADDR_MASK) | PRESENT | WRITABLE | ACCESSED | PAGE_SIZE_BIT | GLOBAL | NO_EXECUTE;
    }
    new_pml4.0[direct_map_index] = (pdpt_phys.0 as u64 & ADDR_MASK) | PRESENT | WRITABLE | ACCESSED;

    let loader_pml4_phys = current_pml4();
    let loader_pml4 = unsafe { &*phys2table(loader_pml4_phys) };

    for i in (direct_map_index + 1)..ENTRIES_PER_TABLE {
        if !loader_pml4.entry_present(i) {
            continue;
        }

        let loader_pdpt_phys = loader_pml4.entry_addr(i);
        let loader_pdpt = unsafe { &*phys2table(loader_pdpt_phys) };
        let cloned_pdpt_phys = clone_subtree(loader_pdpt, 3)?;

        let flags = loader_pml4.0[i] & !ADDR_MASK;
        new_pml4.0[i] = (cloned_pdpt_phys.0 as u64 & ADDR_MASK) | flags;
    }

    load_cr3(new_pml4_phys);
    unsafe {
        mark_translation_ready();
    }

    logger::log_info!(
        "paging rebuilt: direct map at {:#x}, kernel clone at {:#x}",
        DIRECT_MAP_BASE,
        KERNEL_BASE
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[macros::test_fn]
    fn test_direct_map_index_constant() {
        assert_eq!(VirtAddr(DIRECT_MAP_BASE).next_level_index(3), 273);
    }

    #[macros::test_fn]
    fn test_entry_flags_layout() {
        let entry: u64 = PRESENT | WRITABLE | ACCESSED | PAGE_SIZE_BIT | GLOBAL | NO_EXECUTE;
        assert_ne!(entry & PRESENT, 0);
        assert_ne!(entry & NO_EXECUTE, 0);
        assert_eq!(entry & ADDR_MASK, 0);
    }
}
