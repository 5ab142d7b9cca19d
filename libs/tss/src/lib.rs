// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Key-managed thread-local storage with cleanup callbacks.
//!
//! Unlike `std::thread_local!`, keys are created and deleted at runtime and
//! in unbounded number: [`create`] hands out a key (recycled through a
//! free-list), every thread lazily grows its own slot table, and a cleanup
//! registered with the key runs for each live value: at thread exit, at
//! value replacement, and at key deletion, where the values of *all*
//! threads are collected under the registry lock and cleaned up after it is
//! released.
//!
//! The raw interface ([`create`]/[`remove`]/[`get`]/[`set`]) deals in
//! `*mut ()`; [`Pointer`] is the typed owner built on top of it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A runtime-created thread-local storage key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Key(u32);

/// Cleanup callback invoked with each live value of a key.
///
/// Shared because a key deletion runs it once per thread that holds a
/// value; it must not touch the key it belongs to.
pub type Cleanup = Arc<dyn Fn(*mut ()) + Send + Sync>;

struct Host {
    cleanups: Vec<Option<Cleanup>>,
    free_keys: Vec<u32>,
    contexts: HashMap<u64, Arc<Context>>,
}

/// One thread's slot table, shared with the registry so key deletion can
/// null out entries of other threads.
struct Context {
    slots: Mutex<Vec<usize>>,
}

fn host() -> &'static Mutex<Host> {
    static HOST: std::sync::OnceLock<Mutex<Host>> = std::sync::OnceLock::new();
    HOST.get_or_init(|| {
        Mutex::new(Host {
            cleanups: Vec::new(),
            free_keys: Vec::new(),
            contexts: HashMap::new(),
        })
    })
}

fn next_context_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Registers the calling thread's context on first use and runs cleanups
/// when the thread exits.
struct ContextGuard {
    id: u64,
    context: Arc<Context>,
}

thread_local! {
    static CONTEXT: RefCell<Option<ContextGuard>> = const { RefCell::new(None) };
}

fn with_context<R>(f: impl FnOnce(&Context) -> R) -> R {
    CONTEXT.with(|cell| {
        let mut cell = cell.borrow_mut();
        let guard = cell.get_or_insert_with(|| {
            let id = next_context_id();
            let context = Arc::new(Context {
                slots: Mutex::new(Vec::new()),
            });
            host().lock().unwrap().contexts.insert(id, context.clone());
            ContextGuard { id, context }
        });
        f(&guard.context)
    })
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // run cleanups for every live value; a cleanup may set values
        // again, so loop until the table stays empty
        loop {
            let slots = {
                let mut slots = self.context.slots.lock().unwrap();
                if slots.iter().all(|&v| v == 0) {
                    break;
                }
                std::mem::take(&mut *slots)
            };
            let cleanups: Vec<Option<Cleanup>> = {
                let host = host().lock().unwrap();
                slots
                    .iter()
                    .enumerate()
                    .map(|(key, &value)| {
                        if value == 0 {
                            None
                        } else {
                            host.cleanups.get(key).cloned().flatten()
                        }
                    })
                    .collect()
            };
            for (cleanup, value) in cleanups.into_iter().zip(slots) {
                if value != 0
                    && let Some(cleanup) = cleanup
                {
                    cleanup(value as *mut ());
                }
            }
        }
        host().lock().unwrap().contexts.remove(&self.id);
    }
}

/// Creates a key, recycling a previously removed one when possible.
pub fn create(cleanup: Option<Cleanup>) -> Key {
    let mut host = host().lock().unwrap();
    if let Some(key) = host.free_keys.pop() {
        host.cleanups[key as usize] = cleanup;
        Key(key)
    } else {
        let key = u32::try_from(host.cleanups.len()).expect("tss key space exhausted");
        host.cleanups.push(cleanup);
        Key(key)
    }
}

/// Deletes `key`: nulls the entry in every registered thread context,
/// collects the live values under the registry lock, and runs the key's
/// cleanup on them after the lock is released (so cleanups may use tss
/// themselves). The key id is recycled.
pub fn remove(key: Key) {
    let index = key.0 as usize;
    let (cleanup, values) = {
        let mut host = host().lock().unwrap();
        let Some(slot) = host.cleanups.get_mut(index) else {
            return;
        };
        let cleanup = slot.take();

        let mut values = Vec::new();
        for context in host.contexts.values() {
            let mut slots = context.slots.lock().unwrap();
            if let Some(value) = slots.get_mut(index)
                && *value != 0
            {
                values.push(std::mem::take(value));
            }
        }
        host.free_keys.push(key.0);
        (cleanup, values)
    };

    if let Some(cleanup) = cleanup {
        tracing::trace!(key = key.0, values = values.len(), "running key cleanups");
        for value in values {
            cleanup(value as *mut ());
        }
    }
}

/// The calling thread's value for `key`; null when unset.
#[must_use]
pub fn get(key: Key) -> *mut () {
    with_context(|context| {
        let slots = context.slots.lock().unwrap();
        slots.get(key.0 as usize).map_or(core::ptr::null_mut(), |&v| v as *mut ())
    })
}

/// Sets the calling thread's value for `key`. No cleanup runs for a value
/// this replaces; callers owning the old value should [`get`] it first.
pub fn set(key: Key, value: *mut ()) {
    with_context(|context| {
        let mut slots = context.slots.lock().unwrap();
        let index = key.0 as usize;
        if slots.len() <= index {
            slots.resize(index + 1, 0);
        }
        slots[index] = value as usize;
    });
}

// === impl Pointer ===

/// A typed per-thread pointer owning its key.
///
/// Each thread observes its own value. Dropping the `Pointer` deletes the
/// key, dropping every thread's boxed value in the process.
pub struct Pointer<T: Send + 'static> {
    key: Key,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Pointer<T> {
    #[must_use]
    pub fn new() -> Self {
        let cleanup: Cleanup = Arc::new(|value| {
            // Safety: every value stored through this key is a leaked
            // `Box<T>` owned by the table
            drop(unsafe { Box::from_raw(value.cast::<T>()) });
        });
        Self {
            key: create(Some(cleanup)),
            _marker: PhantomData,
        }
    }

    /// Replaces the calling thread's value, dropping the previous one.
    pub fn set(&self, value: T) {
        self.take();
        set(self.key, Box::into_raw(Box::new(value)).cast::<()>());
    }

    /// Removes and returns the calling thread's value.
    pub fn take(&self) -> Option<Box<T>> {
        let old = get(self.key);
        if old.is_null() {
            return None;
        }
        set(self.key, core::ptr::null_mut());
        // Safety: the non-null value came from `set`'s Box::into_raw and
        // was just detached from the table
        Some(unsafe { Box::from_raw(old.cast::<T>()) })
    }

    /// Drops the calling thread's value, if any.
    pub fn clear(&self) {
        drop(self.take());
    }

    /// The calling thread's raw value; null when unset. The pointee stays
    /// owned by the table.
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        get(self.key).cast::<T>()
    }

    /// Runs `f` with a reference to the calling thread's value.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let ptr = self.as_ptr();
        if ptr.is_null() {
            f(None)
        } else {
            // Safety: the value is owned by this thread's slot and only
            // this thread mutates it; the reference does not outlive `f`
            f(Some(unsafe { &*ptr }))
        }
    }
}

impl<T: Send + 'static> Default for Pointer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Pointer<T> {
    fn drop(&mut self) {
        remove(self.key);
    }
}

impl<T: Send + 'static> std::fmt::Debug for Pointer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pointer").field("key", &self.key.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // the key table is a process-wide singleton; serialize the tests so
    // key-recycling assertions cannot race another test's create/remove
    fn serial() -> std::sync::MutexGuard<'static, ()> {
        static GUARD: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();
        GUARD
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[test]
    fn values_are_per_thread() {
        let _serial = serial();
        let pointer = Arc::new(Pointer::<u32>::new());
        pointer.set(1);

        let remote = pointer.clone();
        std::thread::spawn(move || {
            assert!(remote.as_ptr().is_null());
            remote.set(2);
            remote.with(|v| assert_eq!(v.copied(), Some(2)));
        })
        .join()
        .unwrap();

        pointer.with(|v| assert_eq!(v.copied(), Some(1)));
    }

    #[test]
    fn cleanup_runs_at_thread_exit() {
        struct NoisyDrop(Arc<AtomicUsize>);
        impl Drop for NoisyDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _serial = serial();
        let drops = Arc::new(AtomicUsize::new(0));
        let pointer = Arc::new(Pointer::<NoisyDrop>::new());

        let remote = pointer.clone();
        let drops2 = drops.clone();
        std::thread::spawn(move || {
            remote.set(NoisyDrop(drops2));
        })
        .join()
        .unwrap();

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn key_deletion_collects_other_threads() {
        struct NoisyDrop(Arc<AtomicUsize>);
        impl Drop for NoisyDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _serial = serial();
        let drops = Arc::new(AtomicUsize::new(0));
        let pointer = Arc::new(Pointer::<NoisyDrop>::new());

        // park a value in a thread that stays alive past the deletion
        let remote = pointer.clone();
        let drops2 = drops.clone();
        let (armed_tx, armed_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            remote.set(NoisyDrop(drops2));
            armed_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        armed_rx.recv().unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(pointer);
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        // the thread-exit pass must not double-drop the collected value
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn keys_are_recycled() {
        let _serial = serial();
        let a = create(None);
        remove(a);
        let b = create(None);
        assert_eq!(a, b);
        remove(b);
    }

    #[test]
    fn replacement_drops_the_old_value() {
        struct NoisyDrop(Arc<AtomicUsize>);
        impl Drop for NoisyDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _serial = serial();
        let drops = Arc::new(AtomicUsize::new(0));
        let pointer = Pointer::<NoisyDrop>::new();
        pointer.set(NoisyDrop(drops.clone()));
        pointer.set(NoisyDrop(drops.clone()));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        pointer.clear();
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }
}
