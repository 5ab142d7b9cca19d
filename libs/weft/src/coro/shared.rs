// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::awaiter::{Awaiter, allow_inline};
use crate::executor::ExecutorHandle;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::sync::SpinMutex;
use crate::task;
use core::any::Any;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::VecDeque;

/// The shared coroutine transport: one producer, any number of awaiters.
///
/// Cloneable; every awaiter observes a value equal to the produced value
/// (delivered as a clone; the transport promises equality, not identity).
/// A panic in the producer is re-raised at every awaiter's resume site as a
/// message-preserving panic.
///
/// Obtained from [`spawn`][crate::coro::spawn].
pub struct Async<T> {
    state: Arc<Shared<T>>,
}

/// The awaitable created by awaiting or [`configure`][Async::configure]-ing
/// an [`Async`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct AsyncAwait<T> {
    state: Arc<Shared<T>>,
    target: Option<ExecutorHandle>,
    registered: bool,
    /// Position of this consumer's record in the awaiter list, for in-place
    /// waker refreshes; `None` for hop markers, which have no record.
    index: Option<usize>,
}

pub(crate) struct Shared<T> {
    ready: AtomicBool,
    /// Pending awaiters in registration order. Only mutated while `ready`
    /// is false; the publish transition drains it exactly once.
    waiters: SpinMutex<VecDeque<Awaiter>>,
    outcome: SpinMutex<Outcome<T>>,
}

enum Outcome<T> {
    Empty,
    Value(T),
    Panicked(String),
}

// === impl Shared ===

impl<T> Shared<T> {
    pub(crate) fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            waiters: SpinMutex::new(VecDeque::new()),
            outcome: SpinMutex::new(Outcome::Empty),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Publishes the outcome and dispatches every registered awaiter.
    /// Called exactly once, by the producer.
    pub(crate) fn complete(&self, result: Result<T, Box<dyn Any + Send>>) {
        *self.outcome.lock() = match result {
            Ok(value) => Outcome::Value(value),
            Err(payload) => Outcome::Panicked(crate::error::panic_message(&*payload)),
        };

        self.ready.store(true, Ordering::Release);
        // once ready is visible no registration touches the list again, so
        // the drain below owns every record
        let drained = {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut *waiters)
        };
        tracing::trace!(awaiters = drained.len(), "publishing shared transport");
        for awaiter in drained {
            awaiter.dispatch();
        }
    }

    /// Registers `awaiter` unless the transport completed first, in which
    /// case the record is handed back. On success, returns the record's
    /// position in the list; positions are stable until the publish drain
    /// empties it wholesale.
    fn transit(&self, awaiter: Awaiter) -> Result<usize, Awaiter> {
        if self.is_ready() {
            return Err(awaiter);
        }
        let mut waiters = self.waiters.lock();
        // the publish transition sets ready before draining; re-check under
        // the lock so a registration cannot slip in behind the drain
        if self.is_ready() {
            return Err(awaiter);
        }
        waiters.push_back(awaiter);
        Ok(waiters.len() - 1)
    }

    /// Re-arms the record at `index` with the waker of the latest poll.
    /// Runtimes may re-poll a pending future without an intervening wake,
    /// and a future that moved between tasks must be woken through its new
    /// waker.
    ///
    /// Returns `false` when the transport completed in the meantime (the
    /// record is gone or about to be drained); the caller must take the
    /// value itself.
    fn refresh_waker(&self, index: usize, waker: &core::task::Waker) -> bool {
        let mut waiters = self.waiters.lock();
        if self.is_ready() {
            return false;
        }
        if let Some(record) = waiters.get_mut(index) {
            record.refresh_waker(waker);
        }
        true
    }
}

impl<T: Clone> Shared<T> {
    fn get(&self) -> T {
        match &*self.outcome.lock() {
            Outcome::Value(value) => value.clone(),
            Outcome::Panicked(message) => panic!("awaited coroutine panicked: {message}"),
            Outcome::Empty => unreachable!("transport resumed before publication"),
        }
    }
}

// === impl Async ===

impl<T> Async<T> {
    pub(crate) fn new(state: Arc<Shared<T>>) -> Self {
        Self { state }
    }

    /// `true` once the producing coroutine has finished.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// An awaitable that resumes the awaiter on `target` rather than on the
    /// executor the await point was captured on.
    ///
    /// The target is honored for runtime coroutines only. A foreign
    /// consumer (a future driven by some other runtime) cannot be migrated;
    /// it is woken through its own waker and resumes wherever its runtime
    /// places it.
    pub fn configure(&self, target: &ExecutorHandle) -> AsyncAwait<T> {
        AsyncAwait {
            state: self.state.clone(),
            target: Some(target.clone()),
            registered: false,
            index: None,
        }
    }
}

impl<T> Clone for Async<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Async<T> {
    type Output = T;
    type IntoFuture = AsyncAwait<T>;

    fn into_future(self) -> AsyncAwait<T> {
        AsyncAwait {
            state: self.state,
            target: None,
            registered: false,
            index: None,
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for &Async<T> {
    type Output = T;
    type IntoFuture = AsyncAwait<T>;

    fn into_future(self) -> AsyncAwait<T> {
        AsyncAwait {
            state: self.state.clone(),
            target: None,
            registered: false,
            index: None,
        }
    }
}

impl<T> core::fmt::Debug for Async<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Async")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

// === impl AsyncAwait ===

impl<T: Clone + Send + 'static> Future for AsyncAwait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        // every field is Unpin
        let this = self.get_mut();

        if this.registered {
            // dispatched (or spuriously repolled); hop again if a racing
            // publisher resumed us away from the configured target
            if !allow_inline(this.target.as_ref())
                && let Some(task) = task::current()
            {
                task.defer_to(this.target.clone());
                return Poll::Pending;
            }
            if this.state.is_ready() {
                return Poll::Ready(this.state.get());
            }
            // a runtime may legally re-poll without an intervening wake;
            // re-arm the registered record instead of registering a second
            // one
            if task::current().is_none()
                && let Some(index) = this.index
                && !this.state.refresh_waker(index, cx.waker())
            {
                // publication raced the refresh; no wake is coming
                return Poll::Ready(this.state.get());
            }
            return Poll::Pending;
        }

        if this.state.is_ready() {
            return this.take_or_hop();
        }

        let awaiter = Awaiter::capture(this.target.clone(), cx);
        match this.state.transit(awaiter) {
            Ok(index) => {
                this.registered = true;
                this.index = Some(index);
                Poll::Pending
            }
            // completed while we were registering
            Err(_awaiter) => this.take_or_hop(),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncAwait<T> {
    /// The transport is ready: either take the value on this thread or
    /// reschedule onto the configured target first.
    fn take_or_hop(&mut self) -> Poll<T> {
        if allow_inline(self.target.as_ref()) {
            return Poll::Ready(self.state.get());
        }
        match task::current() {
            Some(task) => {
                self.registered = true;
                task.defer_to(self.target.clone());
                Poll::Pending
            }
            // a foreign awaiter cannot migrate; resume where its runtime
            // put it
            None => Poll::Ready(self.state.get()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::spawn;
    use crate::executor::ManualDrainExecutor;
    use crate::loom::sync::atomic::AtomicUsize;
    use crate::task::CoroTask;
    use std::time::Duration;

    fn gate_await(gate: &Arc<Shared<()>>) -> AsyncAwait<()> {
        AsyncAwait {
            state: gate.clone(),
            target: None,
            registered: false,
            index: None,
        }
    }

    #[test]
    fn awaiters_before_and_after_publication() {
        let exec = ManualDrainExecutor::new();
        let observed = Arc::new(AtomicUsize::new(0));

        // the producer suspends on a gate we publish by hand
        let gate: Arc<Shared<()>> = Arc::new(Shared::new());
        let produced = {
            let wait = gate_await(&gate);
            spawn(async move {
                wait.await;
                42_usize
            })
        };
        assert!(!produced.is_ready());

        // two awaiters register before publication, from the executor
        for _ in 0..2 {
            let produced = produced.clone();
            let observed = observed.clone();
            let task = CoroTask::new(async move {
                observed.fetch_add(produced.await, Ordering::Relaxed);
            });
            exec.handle().enqueue(move || task.run());
        }
        exec.drain_once();
        assert_eq!(observed.load(Ordering::Relaxed), 0);

        // publishing the gate resumes the producer in place, which in turn
        // dispatches both awaiters back onto their captured executor
        gate.complete(Ok(()));
        assert!(produced.is_ready());
        assert_eq!(observed.load(Ordering::Relaxed), 0);
        exec.drain_once();
        assert_eq!(observed.load(Ordering::Relaxed), 2 * 42);

        // an awaiter registering after publication resolves on its own
        let produced2 = produced.clone();
        let observed2 = observed.clone();
        let late = CoroTask::new(async move {
            observed2.fetch_add(produced2.await, Ordering::Relaxed);
        });
        late.run();
        assert_eq!(observed.load(Ordering::Relaxed), 3 * 42);
    }

    #[test]
    fn await_after_completion_is_immediate() {
        let produced = spawn(async move { 7_u32 });
        assert!(produced.is_ready());

        // the producer ran eagerly on this thread; a poll-level await
        // resolves without any executor involved
        let mut awaitable = tokio_test::task::spawn(produced.into_future());
        assert_eq!(awaitable.poll(), Poll::Ready(7));
    }

    #[test]
    fn foreign_awaiters_use_their_waker() {
        let (tx, rx) = std::sync::mpsc::channel::<Arc<Shared<u32>>>();

        let driver = std::thread::spawn(move || {
            let state = rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            state.complete(Ok(13));
        });

        let state = Arc::new(Shared::new());
        tx.send(state.clone()).unwrap();

        let value = futures::executor::block_on(AsyncAwait {
            state,
            target: None,
            registered: false,
            index: None,
        });
        assert_eq!(value, 13);
        driver.join().unwrap();
    }

    #[test]
    fn foreign_repolls_reuse_the_registration() {
        let state: Arc<Shared<u32>> = Arc::new(Shared::new());

        let mut awaitable = tokio_test::task::spawn(AsyncAwait {
            state: state.clone(),
            target: None,
            registered: false,
            index: None,
        });
        assert!(awaitable.poll().is_pending());
        // combinators may re-poll a pending future with no wake in between;
        // the registration is re-armed, not duplicated
        assert!(awaitable.poll().is_pending());
        assert!(awaitable.poll().is_pending());
        assert_eq!(state.waiters.lock().len(), 1);

        state.complete(Ok(6));
        assert!(awaitable.is_woken());
        assert_eq!(awaitable.poll(), Poll::Ready(6));
    }

    #[test]
    fn producer_panic_reaches_every_awaiter() {
        let produced = spawn(async move {
            if true {
                panic!("production failed");
            }
            1_u32
        });
        assert!(produced.is_ready());

        for _ in 0..2 {
            let produced = produced.clone();
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                let mut awaitable = tokio_test::task::spawn(produced.into_future());
                let _ = awaitable.poll();
            }));
            let payload = caught.expect_err("panic must propagate to the awaiter");
            let message = crate::error::panic_message(&*payload);
            assert!(message.contains("production failed"), "got: {message}");
        }
    }
}
