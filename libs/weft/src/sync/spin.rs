// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::sync::{CachePadded, SpinWait};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// A spinning mutual exclusion primitive for low-contention critical
/// sections.
///
/// Acquisition busy-waits with [`SpinWait`] while the lock is held; there
/// is no queueing and no OS parking, so critical sections must stay short.
/// The lock word lives on its own cache line to keep waiters from
/// invalidating neighboring data.
pub struct SpinMutex<T> {
    lock: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

/// An RAII scoped-lock guard. The lock is released when the guard is
/// dropped.
#[must_use = "if unused the SpinMutex will immediately unlock"]
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: moving the protected value between threads is what the lock is for
unsafe impl<T: Send> Send for SpinMutex<T> {}
// Safety: the lock word serializes all access to `data`
unsafe impl<T: Send> Sync for SpinMutex<T> {}

// === impl SpinMutex ===

impl<T> SpinMutex<T> {
    #[cfg(not(loom))]
    pub const fn new(val: T) -> SpinMutex<T> {
        SpinMutex {
            lock: CachePadded(AtomicBool::new(false)),
            data: UnsafeCell::new(val),
        }
    }

    #[cfg(loom)]
    pub fn new(val: T) -> SpinMutex<T> {
        SpinMutex {
            lock: CachePadded(AtomicBool::new(false)),
            data: UnsafeCell::new(val),
        }
    }
}

impl<T> SpinMutex<T> {
    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let mut spinner = SpinWait::new();
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                spinner.spin_once();
            }
        }

        SpinMutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Attempts to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinMutexGuard {
                mutex: self,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data without locking;
    /// the exclusive borrow statically guarantees no guards exist.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: `&mut self` rules out any live guard
        self.data.with_mut(|data| unsafe { &mut *data })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinMutex<T> {
    #[inline]
    fn default() -> SpinMutex<T> {
        SpinMutex::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinMutex").field("data", &&*guard).finish(),
            None => f.debug_struct("SpinMutex").field("data", &"<locked>").finish(),
        }
    }
}

// === impl SpinMutexGuard ===

// Safety: the guard holds the lock; sharing it shares `&T`
unsafe impl<T: Sync> Sync for SpinMutexGuard<'_, T> {}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.store(false, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
