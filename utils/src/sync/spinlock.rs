//! A minimal spinlock, used for every process-wide mutable singleton in this workspace (the
//! frame allocator, GDT, IDT, VMXON/VMCS regions, the vCPU). On a single core the lock never
//! actually spins, but going through one `SpinLock<T>` type keeps the locking discipline uniform
//! if this ever grows a second CPU.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Hook run right before a guard releases its lock. Most singletons don't need one; the default
/// no-op covers them.
pub trait SpinLockable {
    fn custom_unlock(&mut self) {}
}

pub struct SpinLock<T: SpinLockable> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: SpinLockable> Send for SpinLock<T> {}
unsafe impl<T: SpinLockable> Sync for SpinLock<T> {}

impl<T: SpinLockable> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            // SAFETY: we just acquired exclusive access above.
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T: SpinLockable> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<T: SpinLockable> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.data.custom_unlock();
        self.lock.unlock();
    }
}

impl<T: SpinLockable> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: SpinLockable> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}
