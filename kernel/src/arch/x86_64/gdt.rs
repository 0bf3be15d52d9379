//! Long-mode GDT and TSS construction.
//!
//! Eight 8-byte entries: null, kernel data, kernel code, and a 16-byte TSS descriptor occupying
//! the last two slots. VMX host state requires a non-null TR, so the TSS is always loaded even
//! though nothing on this single CPU ever privilege-switches through it.

use core::{arch::asm, mem::offset_of, mem::size_of};

use super::DescriptorTablePtr;

/// Selector for the kernel data segment.
pub const KERNEL_DS: u16 = 0x08;
/// Selector for the kernel code segment (64-bit, DPL=0).
pub const KERNEL_CS: u16 = 0x10;
/// Selector for the TSS descriptor.
pub const TSS_SEL: u16 = 0x18;

const ACCESS_DATA: u64 = 0x92;
const FLAGS_DATA: u64 = 0xC;
const ACCESS_CODE: u64 = 0x9A;
const FLAGS_CODE: u64 = 0xA;

/// A long-mode TSS. Every RSP/IST slot is zero; `iomap_base = size_of::<Tss>()` disables the I/O
/// bitmap entirely (no port range is ever consulted).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Tss {
    reserved_0: u32,
    rsp: [u64; 3],
    reserved_1: u64,
    ist: [u64; 7],
    reserved_2: u64,
    reserved_3: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            reserved_0: 0,
            rsp: [0; 3],
            reserved_1: 0,
            ist: [0; 7],
            reserved_2: 0,
            reserved_3: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

static mut TSS: Tss = Tss::new();
static mut GDT: Gdt = Gdt([0; 8]);

#[repr(C, align(8))]
struct Gdt([u64; 8]);

/// Initializes the GDT and TSS, loads them, and reloads every segment register.
///
/// # Safety
/// Must run exactly once, early in boot, before any code relies on long-mode segment selectors.
pub unsafe fn init() {
    unsafe {
        #[allow(static_mut_refs)]
        let tss_base = core::ptr::addr_of!(TSS).addr() as u64;
        #[allow(static_mut_refs)]
        let tss_limit = (size_of::<Tss>() - 1) as u64;

        #[allow(static_mut_refs)]
        {
            GDT.0[0] = 0;
            GDT.0[1] = segment_descriptor(ACCESS_DATA, FLAGS_DATA);
            GDT.0[2] = segment_descriptor(ACCESS_CODE, FLAGS_CODE);
            let (low, high) = tss_descriptor(tss_base, tss_limit);
            GDT.0[3] = low;
            GDT.0[4] = high;
        }

        load();
        reload_segments();
        load_tr();
    }

    logger::log_info!("GDT installed, TR loaded with selector {:#x}", TSS_SEL);
}

/// Packs a flat (base=0, limit=0xFFFFF) code/data segment descriptor.
const fn segment_descriptor(access: u64, flags: u64) -> u64 {
    let limit_0: u64 = 0xFFFF;
    let limit_1: u64 = 0xF;
    limit_0 | (access << 40) | (limit_1 << 48) | (flags << 52)
}

/// Packs the two 8-byte slots of an available-TSS descriptor (type=9, DPL=0, present).
const fn tss_descriptor(base: u64, limit: u64) -> (u64, u64) {
    let base_0 = base & 0xFF_FFFF;
    let base_1 = (base >> 24) & 0xFF;
    let base_2 = base >> 32;
    let access: u64 = 0x89; // present, DPL=0, type=9 (64-bit available TSS)

    let low = (limit & 0xFFFF) | (base_0 << 16) | (access << 40) | (((limit >> 16) & 0xF) << 48) | (base_1 << 56);
    let high = base_2;

    (low, high)
}

unsafe fn load() {
    #[allow(static_mut_refs)]
    let gdtr = DescriptorTablePtr::new(
        core::ptr::addr_of!(GDT).addr() as u64,
        (size_of::<Gdt>() - 1) as u16,
    );

    unsafe {
        asm!("lgdt [{}]", in(reg) &gdtr, options(nostack));
    }
}

unsafe fn reload_segments() {
    unsafe {
        asm!(
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov fs, {data:x}",
            "mov gs, {data:x}",
            "mov ss, {data:x}",
            "push {code}",
            "lea {tmp}, [55f + rip]",
            "push {tmp}",
            "retfq",
            "55:",
            data = in(reg) KERNEL_DS,
            code = in(reg) u64::from(KERNEL_CS),
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

unsafe fn load_tr() {
    unsafe {
        asm!("ltr {:x}", in(reg) TSS_SEL, options(nostack, nomem));
    }
}

/// The "full" form of a segment selector (the visible selector plus the cached base/limit/access
/// a descriptor carries). Used by the VMCS builder to decode `TR`'s hidden state.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct FullSegmentSelector {
    pub selector: u16,
    pub attributes: u16,
    pub limit: u32,
    pub base: u64,
}

/// Decodes the base address of a busy/available TSS descriptor occupying two consecutive GDT
/// slots, per the layout in §4.7 of the VMCS host-state design: low 24 bits of base in slot 0
/// bits 16-39, bits 24-31 in slot 0 bits 56-63, and bits 32-63 in slot 1's low quadword.
pub fn decode_tss_base(selector: u16) -> u64 {
    let index = (selector >> 3) as usize;
    #[allow(static_mut_refs)]
    let low = unsafe { GDT.0[index] };
    #[allow(static_mut_refs)]
    let high = unsafe { GDT.0[index + 1] };

    let base_0 = (low >> 16) & 0xFF_FFFF;
    let base_1 = (low >> 56) & 0xFF;
    let base_2 = high & 0xFFFF_FFFF;

    base_0 | (base_1 << 24) | (base_2 << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[macros::test_fn]
    fn test_full_segment_selector_layout() {
        assert_eq!(offset_of!(FullSegmentSelector, selector), 0);
        assert_eq!(offset_of!(FullSegmentSelector, attributes), 2);
        assert_eq!(offset_of!(FullSegmentSelector, limit), 4);
        assert_eq!(offset_of!(FullSegmentSelector, base), 8);
    }

    #[macros::test_fn]
    fn test_tss_layout() {
        assert_eq!(size_of::<Tss>(), 104);
        assert_eq!(offset_of!(Tss, iomap_base), 102);
    }

    #[macros::test_fn]
    fn test_tss_descriptor_roundtrip() {
        let base: u64 = 0xFFFF_8880_1234_5678;
        let (low, high) = tss_descriptor(base, 103);

        let base_0 = (low >> 16) & 0xFF_FFFF;
        let base_1 = (low >> 56) & 0xFF;
        let base_2 = high & 0xFFFF_FFFF;
        let decoded = base_0 | (base_1 << 24) | (base_2 << 32);

        assert_eq!(decoded, base);
    }
}
