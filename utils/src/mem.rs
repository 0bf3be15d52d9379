//! Mem related usefull wrappers and utility functions, and the `PhysAddr`/`VirtAddr` newtypes
//! shared by every crate in the workspace.

use core::fmt;
use core::ops::{Add, Sub};
use core::ptr::NonNull;

use crate::collections::fast_lazy_static::FastLazyStatic;

/// Base of the 512 GiB direct map window, built once during paging reconstruction.
pub const DIRECT_MAP_BASE: usize = 0xFFFF_8880_0000_0000;

/// Base of the cloned kernel-image region (the loader's upper half).
pub const KERNEL_BASE: usize = 0xFFFF_FFFF_8000_0000;

/// Whether `virt2phys`/`phys2virt` may be used yet (set once by the paging rebuild).
static TRANSLATION_READY: FastLazyStatic<bool> = FastLazyStatic::new(false);

/// Marks the direct map / kernel clone as installed. Called exactly once, right after CR3 is
/// switched to the rebuilt tree.
///
/// # Safety
/// Must be called exactly once, after the new page tables are live.
pub unsafe fn mark_translation_ready() {
    unsafe { TRANSLATION_READY.set(true) };
}

/// A physical address
#[repr(transparent)]
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq)]
pub struct PhysAddr(pub usize);

/// A virtual address
#[repr(transparent)]
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Translate a direct-map or kernel-image virtual address to its physical address.
    ///
    /// Before the paging rebuild installs its one-shot latch, addressing is still identity
    /// mapped by the loader, so this is the identity function.
    pub fn virt2phys(self) -> PhysAddr {
        if !TRANSLATION_READY.get() {
            return PhysAddr(self.0);
        }

        if self.0 >= KERNEL_BASE {
            PhysAddr(self.0 - KERNEL_BASE)
        } else {
            PhysAddr(self.0 - DIRECT_MAP_BASE)
        }
    }

    #[cfg(target_arch = "x86_64")]
    pub const fn next_level_index(self, level: usize) -> usize {
        assert!(level < 5);

        (self.0 >> (12 + (level * 9))) & 0b1_1111_1111
    }
}

impl PhysAddr {
    /// Translate a physical address to its direct-map virtual address.
    pub fn phys2virt(self) -> VirtAddr {
        if !TRANSLATION_READY.get() {
            return VirtAddr(self.0);
        }

        VirtAddr(self.0 + DIRECT_MAP_BASE)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl<T> From<*const T> for VirtAddr {
    fn from(value: *const T) -> Self {
        Self(value.addr())
    }
}

impl<T> From<*mut T> for VirtAddr {
    fn from(value: *mut T) -> Self {
        Self(value.addr())
    }
}

impl<T> From<NonNull<T>> for VirtAddr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr().addr())
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Add<usize> for PhysAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for VirtAddr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<usize> for PhysAddr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;
    fn sub(self, rhs: VirtAddr) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;
    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0 - rhs.0
    }
}

// NOTE: constructing these pointers is safe; using them obviously is not.
impl<T> From<VirtAddr> for *const T {
    fn from(value: VirtAddr) -> Self {
        value.0 as *const T
    }
}

impl<T> From<VirtAddr> for *mut T {
    fn from(value: VirtAddr) -> Self {
        value.0 as *mut T
    }
}

impl<T> TryFrom<VirtAddr> for NonNull<T> {
    type Error = ();

    fn try_from(value: VirtAddr) -> Result<Self, Self::Error> {
        NonNull::new(value.0 as *mut T).ok_or(())
    }
}

/// Wrapper to memset some region of memory to some value
pub unsafe fn memset(ptr: *mut u8, value: u8, len: usize) {
    unsafe {
        for i in 0..len {
            core::ptr::write_volatile(ptr.add(i), value);
        }
    };
}

#[macro_export]
macro_rules! ptr_add_layout {
    ($ptr:expr, $i:expr, $layout:expr, $type:ty) => {
        $ptr.cast::<u8>().add($i * $layout.size()).cast::<$type>()
    };
}
