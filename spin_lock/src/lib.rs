//! Spinlock for the WeensyOS kernel.
//!
//! The kernel itself runs with interrupts masked, so kernel data never needs a lock.
//! The only state shared across host threads is the serial log of the machine,
//! which this lock protects.
//!
//! Acquiring the lock polls a flag with an atomic read-modify-write
//! ([`AtomicBool::swap`]) until the previous value was `false`.
#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// An enumeration of possible errors associated while trying to acquire a lock,
/// from the [`try_lock`] method on a [`SpinLock`].
///
/// [`try_lock`]: SpinLock::try_lock
#[derive(Debug, PartialEq, Eq)]
pub enum TryLockError {
    /// The lock could not be acquired at this time because the operation would
    /// otherwise block.
    WouldBlock,
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The data can only be accessed through the RAII guards returned from
/// [`lock`] and [`try_lock`], which guarantees that the data is only ever
/// accessed when the spinlock is locked.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning until it is able to do so.
    ///
    /// Locking a spinlock twice from the same context deadlocks.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            match self.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::WouldBlock) => {
                    while self.locked.load(Ordering::Relaxed) {
                        core::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then [`Err`] is returned.
    /// This function does not block.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, TryLockError> {
        if self.locked.swap(true, Ordering::Acquire) {
            Err(TryLockError::WouldBlock)
        } else {
            Ok(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        }
    }
}

impl<T: ?Sized + Default> Default for SpinLock<T> {
    /// Creates a `SpinLock<T>`, with the `Default` value for T.
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    // Guards must be released by the context that took them.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crate::{SpinLock, TryLockError};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread::scope;

    #[test]
    pub fn smoke() {
        const LENGTH: usize = 256;
        let lock = SpinLock::new(vec![]);
        let start = Arc::new(AtomicBool::new(true));

        scope(|s| {
            for i in 0..LENGTH {
                let d = &lock;
                let start = start.clone();
                s.spawn(move || {
                    while start.load(Ordering::SeqCst) {}
                    let mut d = d.lock();
                    d.push(i);
                });
            }
            start.store(false, Ordering::SeqCst);
        });

        lock.lock().sort();
        assert_eq!(lock.into_inner(), (0..LENGTH).collect::<Vec<_>>());
    }

    #[test]
    pub fn try_lock_would_block() {
        let lock = SpinLock::new(0);
        let guard = lock.lock();
        assert!(matches!(lock.try_lock(), Err(TryLockError::WouldBlock)));
        drop(guard);
        *lock.try_lock().ok().unwrap() += 1;
        assert_eq!(lock.into_inner(), 1);
    }
}
