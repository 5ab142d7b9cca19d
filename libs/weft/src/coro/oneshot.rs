// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::awaiter::{Awaiter, allow_inline};
use crate::executor::ExecutorHandle;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::task;
use core::any::Any;
use core::pin::Pin;
use core::ptr;
use core::task::{Context, Poll, Waker};

/// The one-shot coroutine transport: one producer, exactly one awaiter.
///
/// The move-only counterpart of [`Async`][crate::coro::Async]: the value is
/// moved to the single consumer, a producer panic payload is resumed
/// verbatim, and the rendezvous is a single atomic slot instead of a locked
/// list.
///
/// "Exactly one awaiter" means one logical consumer: registering a second
/// distinct consumer (another task, another await of a leaked handle) is a
/// programmer error and panics. A runtime that re-polls the one pending
/// await point without an intervening wake (as combinators legitimately
/// do) is fine; the registration is updated in place.
///
/// Obtained from [`spawn_value`][crate::coro::spawn_value].
pub struct ValueAsync<T> {
    state: Arc<Oneshot<T>>,
}

/// The awaitable created by awaiting or
/// [`configure`][ValueAsync::configure]-ing a [`ValueAsync`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct ValueAwait<T> {
    state: Arc<Oneshot<T>>,
    target: Option<ExecutorHandle>,
    registered: bool,
}

/// Producer/consumer rendezvous over one atomic pointer:
///
/// - null: nobody arrived yet
/// - a record pointer: the awaiter registered first
/// - [`finalized`][Oneshot::finalized]: the producer published
///
/// The value cell is written by the producer before the finalizing swap and
/// read by the consumer only after observing it, so the swap's
/// acquire/release pairing is the only synchronization the cell needs.
pub(crate) struct Oneshot<T> {
    slot: AtomicPtr<Awaiter>,
    value: UnsafeCell<Option<Result<T, Box<dyn Any + Send>>>>,
}

// Safety: the slot protocol hands the value cell from the producer to the
// single consumer with release/acquire ordering; the awaiter record is only
// ever owned by one side at a time
unsafe impl<T: Send> Send for Oneshot<T> {}
// Safety: see above; all shared access goes through the atomic slot
unsafe impl<T: Send> Sync for Oneshot<T> {}

// === impl Oneshot ===

impl<T> Oneshot<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }

    /// The sentinel slot value meaning "producer finished". Never
    /// dereferenced.
    fn finalized() -> *mut Awaiter {
        ptr::without_provenance_mut(usize::MAX)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.slot.load(Ordering::Acquire) == Self::finalized()
    }

    /// Publishes the outcome and dispatches the awaiter if one registered
    /// first. Called exactly once, by the producer.
    pub(crate) fn complete(&self, result: Result<T, Box<dyn Any + Send>>) {
        self.value.with_mut(|value| {
            // Safety: the producer owns the cell until the finalizing swap
            // below publishes it
            unsafe {
                *value = Some(result);
            }
        });

        let prev = self.slot.swap(Self::finalized(), Ordering::AcqRel);
        debug_assert!(prev != Self::finalized(), "one-shot published twice");
        if !prev.is_null() {
            // Safety: a non-null, non-sentinel slot value is the Box the
            // awaiter leaked into it, and the swap transferred ownership
            // to us
            let awaiter = unsafe { Box::from_raw(prev) };
            tracing::trace!("publishing one-shot transport to its awaiter");
            awaiter.dispatch();
        }
    }

    /// Registers `awaiter` unless the producer finished first, in which
    /// case the record is handed back.
    ///
    /// # Panics
    ///
    /// Panics when a different consumer is already registered: a one-shot
    /// transport has exactly one. Re-polls of the registered await point go
    /// through [`refresh_waker`][Self::refresh_waker], never through here.
    fn transit(&self, awaiter: Awaiter) -> Result<(), Awaiter> {
        let record = Box::into_raw(Box::new(awaiter));
        loop {
            let current = self.slot.load(Ordering::Acquire);
            if current == Self::finalized() {
                // Safety: the CAS below never succeeded, so the Box is
                // still exclusively ours
                let awaiter = unsafe { Box::from_raw(record) };
                return Err(*awaiter);
            }
            if !current.is_null() {
                // Safety: reclaim before aborting the await
                drop(unsafe { Box::from_raw(record) });
                panic!("a one-shot transport supports exactly one awaiter");
            }
            if self
                .slot
                .compare_exchange_weak(
                    ptr::null_mut(),
                    record,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Re-arms the registered record with the waker of the latest poll.
    /// Runtimes may re-poll a pending future without an intervening wake,
    /// and a future that moved between tasks must be woken through its new
    /// waker.
    ///
    /// Returns `false` when the producer finalized in the meantime: the
    /// record was detached during the update, so no wake is coming and the
    /// caller must take the value itself.
    fn refresh_waker(&self, waker: &Waker) -> bool {
        loop {
            let current = self.slot.load(Ordering::Acquire);
            if current == Self::finalized() {
                return false;
            }
            if current.is_null() {
                // registration precedes any refresh; still pending
                debug_assert!(false, "refresh before registration");
                return true;
            }
            // detach the record so the producer cannot free it mid-update
            if self
                .slot
                .compare_exchange(current, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // Safety: the exchange detached the record; it is exclusively
            // ours until it goes back in
            let mut record = unsafe { Box::from_raw(current) };
            record.refresh_waker(waker);
            let raw = Box::into_raw(record);
            return match self
                .slot
                .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => true,
                Err(actual) => {
                    // Safety: the failed exchange left the Box with us
                    drop(unsafe { Box::from_raw(raw) });
                    if actual == Self::finalized() {
                        // the producer published into the empty slot and
                        // found nobody to dispatch
                        false
                    } else {
                        panic!("a one-shot transport supports exactly one awaiter");
                    }
                }
            };
        }
    }

    /// Moves the outcome out. Only the single consumer calls this, after
    /// the slot reads finalized.
    fn take(&self) -> T {
        let outcome = self.value.with_mut(|value| {
            // Safety: the finalizing swap published the cell and the single
            // consumer is the only reader afterwards
            unsafe { (*value).take() }
        });
        match outcome {
            Some(Ok(value)) => value,
            Some(Err(payload)) => std::panic::resume_unwind(payload),
            None => unreachable!("one-shot transport consumed twice"),
        }
    }
}

impl<T> Drop for Oneshot<T> {
    fn drop(&mut self) {
        let slot = self.slot.load(Ordering::Acquire);
        if !slot.is_null() && slot != Self::finalized() {
            // Safety: both parties are gone; the leaked record is ours to
            // reclaim
            drop(unsafe { Box::from_raw(slot) });
        }
    }
}

// === impl ValueAsync ===

impl<T> ValueAsync<T> {
    pub(crate) fn new(state: Arc<Oneshot<T>>) -> Self {
        Self { state }
    }

    /// `true` once the producing coroutine has finished.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// An awaitable that resumes the awaiter on `target` rather than on the
    /// executor the await point was captured on. Consumes the handle, as
    /// awaiting does.
    ///
    /// The target is honored for runtime coroutines only. A foreign
    /// consumer (a future driven by some other runtime) cannot be migrated;
    /// it is woken through its own waker and resumes wherever its runtime
    /// places it.
    pub fn configure(self, target: &ExecutorHandle) -> ValueAwait<T> {
        ValueAwait {
            state: self.state,
            target: Some(target.clone()),
            registered: false,
        }
    }
}

impl<T: Send + 'static> IntoFuture for ValueAsync<T> {
    type Output = T;
    type IntoFuture = ValueAwait<T>;

    fn into_future(self) -> ValueAwait<T> {
        ValueAwait {
            state: self.state,
            target: None,
            registered: false,
        }
    }
}

impl<T> core::fmt::Debug for ValueAsync<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ValueAsync")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

// === impl ValueAwait ===

impl<T: Send + 'static> Future for ValueAwait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        // every field is Unpin
        let this = self.get_mut();

        if this.registered {
            if !allow_inline(this.target.as_ref())
                && let Some(task) = task::current()
            {
                task.defer_to(this.target.clone());
                return Poll::Pending;
            }
            if this.state.is_ready() {
                return Poll::Ready(this.state.take());
            }
            // a runtime may legally re-poll without an intervening wake;
            // re-arm the registered record instead of registering a second
            // one
            if task::current().is_none() && !this.state.refresh_waker(cx.waker()) {
                // publication raced the refresh; no wake is coming
                return Poll::Ready(this.state.take());
            }
            return Poll::Pending;
        }

        if this.state.is_ready() {
            return this.take_or_hop();
        }

        let awaiter = Awaiter::capture(this.target.clone(), cx);
        match this.state.transit(awaiter) {
            Ok(()) => {
                this.registered = true;
                Poll::Pending
            }
            Err(_awaiter) => this.take_or_hop(),
        }
    }
}

impl<T: Send + 'static> ValueAwait<T> {
    fn take_or_hop(&mut self) -> Poll<T> {
        if allow_inline(self.target.as_ref()) {
            return Poll::Ready(self.state.take());
        }
        match task::current() {
            Some(task) => {
                self.registered = true;
                task.defer_to(self.target.clone());
                Poll::Pending
            }
            None => Poll::Ready(self.state.take()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{spawn_value, switch_to};
    use crate::executor::ManualDrainExecutor;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};
    use crate::task::CoroTask;

    #[test]
    fn rendezvous_delivers_the_value() {
        let produced = spawn_value(async move { 42_u32 });
        assert!(produced.is_ready());

        let observed = Arc::new(AtomicUsize::new(0));
        let observed2 = observed.clone();
        let task = CoroTask::new(async move {
            observed2.store(produced.await as usize, Ordering::Release);
        });
        task.run();

        assert_eq!(observed.load(Ordering::Acquire), 42);
    }

    #[test]
    fn awaiter_registered_before_publication() {
        let exec = ManualDrainExecutor::new();
        let state: Arc<Oneshot<u32>> = Arc::new(Oneshot::new());
        let observed = Arc::new(AtomicUsize::new(0));

        let consumer = ValueAsync::new(state.clone());
        let observed2 = observed.clone();
        let task = CoroTask::new(async move {
            observed2.store(consumer.await as usize, Ordering::Release);
        });
        exec.handle().enqueue(move || task.run());
        exec.drain_once();
        assert_eq!(observed.load(Ordering::Acquire), 0);

        // publication dispatches the awaiter back onto its captured
        // executor
        state.complete(Ok(9));
        assert_eq!(observed.load(Ordering::Acquire), 0);
        exec.drain_once();
        assert_eq!(observed.load(Ordering::Acquire), 9);
    }

    #[test]
    fn moves_across_executors() {
        let exec = ManualDrainExecutor::new();
        let produced = spawn_value(async move { String::from("payload") });

        let observed = Arc::new(crate::sync::SpinMutex::new(None));
        let observed2 = observed.clone();
        let target = exec.handle();
        let task = CoroTask::new(async move {
            switch_to(&target).await;
            let value = produced.await;
            *observed2.lock() = Some(value);
        });
        task.run();

        assert!(observed.lock().is_none());
        exec.drain_once();
        assert_eq!(observed.lock().as_deref(), Some("payload"));
    }

    #[test]
    fn producer_panic_resumes_the_original_payload() {
        let produced = spawn_value(async move {
            if true {
                std::panic::panic_any(1234_i32);
            }
        });

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut awaitable = tokio_test::task::spawn(produced.into_future());
            let _ = awaitable.poll();
        }));
        let payload = caught.expect_err("panic must propagate");
        assert_eq!(payload.downcast_ref::<i32>(), Some(&1234));
    }

    #[test]
    fn foreign_repolls_do_not_count_as_second_awaiters() {
        let state: Arc<Oneshot<u32>> = Arc::new(Oneshot::new());
        let consumer = ValueAsync::new(state.clone());

        let mut awaitable = tokio_test::task::spawn(consumer.into_future());
        assert!(awaitable.poll().is_pending());
        // combinators may re-poll a pending future with no wake in between
        assert!(awaitable.poll().is_pending());
        assert!(awaitable.poll().is_pending());

        state.complete(Ok(5));
        assert!(awaitable.is_woken());
        assert_eq!(awaitable.poll(), Poll::Ready(5));
    }

    #[test]
    #[should_panic = "exactly one awaiter"]
    fn second_awaiter_is_fatal() {
        let state: Arc<Oneshot<u32>> = Arc::new(Oneshot::new());

        let first = ValueAsync::new(state.clone());
        let task = CoroTask::new(async move {
            let _ = first.await;
        });
        task.run();

        let second = ValueAsync::new(state);
        let mut awaitable = tokio_test::task::spawn(second.into_future());
        let _ = awaitable.poll();
    }
}
