// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coroutine value transports and the awaitables around them.
//!
//! [`spawn`] and [`spawn_value`] start a coroutine *eagerly* on the calling
//! thread: it runs until its first suspension point, and from then on each
//! await decides where the coroutine resumes. The producing side publishes
//! through a transport, either [`Async`] (shared, any number of awaiters)
//! or [`ValueAsync`] (move-only, exactly one awaiter), which resumes each
//! awaiter in place when producer and awaiter share an executor, and hops
//! through the awaiter's executor queue otherwise.
//!
//! [`switch_to`] and [`yield_now`] are the two scheduling awaitables: the
//! first always suspends and resumes on a chosen executor, the second
//! re-enqueues on the current one.

mod awaiter;
mod oneshot;
mod shared;

pub use oneshot::{ValueAsync, ValueAwait};
pub use shared::{Async, AsyncAwait};

use crate::executor::{self, ExecutorHandle};
use crate::loom::sync::Arc;
use crate::task::{self, CatchUnwind, CoroTask};
use core::pin::Pin;
use core::task::{Context, Poll};

/// Starts `future` as a coroutine publishing into a shared [`Async`]
/// transport.
///
/// The coroutine runs immediately on the calling thread until it first
/// suspends. A panic inside it is captured and re-raised at every awaiter's
/// resume site.
pub fn spawn<F>(future: F) -> Async<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let state = Arc::new(shared::Shared::new());
    let producer = state.clone();
    let task = CoroTask::new(async move {
        let result = CatchUnwind::new(future).await;
        producer.complete(result);
    });
    task.run();
    Async::new(state)
}

/// Starts `future` as a coroutine publishing into a one-shot [`ValueAsync`]
/// transport.
///
/// Like [`spawn`] but without the sharing overhead: the value is moved to
/// the single awaiter and a captured panic payload is resumed verbatim.
pub fn spawn_value<F>(future: F) -> ValueAsync<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let state = Arc::new(oneshot::Oneshot::new());
    let producer = state.clone();
    let task = CoroTask::new(async move {
        let result = CatchUnwind::new(future).await;
        producer.complete(result);
    });
    task.run();
    ValueAsync::new(state)
}

/// An awaitable that always suspends and resumes the coroutine on `target`.
///
/// After resumption, [`current_executor`][executor::current_executor] is
/// `target`. Awaited from a foreign (non-runtime) future, the hop degrades
/// to waking the foreign waker from the target's queue; placement is then
/// up to the foreign runtime.
pub fn switch_to(target: &ExecutorHandle) -> SwitchTo {
    SwitchTo {
        target: target.clone(),
        fired: false,
    }
}

/// An awaitable that suspends and re-enqueues the coroutine on the current
/// executor, letting other queued tasks run first.
pub fn yield_now() -> YieldNow {
    YieldNow { fired: false }
}

/// Awaits every transport in `transports`, completing once all have
/// completed. Producers run eagerly, so the sequential awaits only order
/// the collection of results, not the work itself.
pub async fn await_all<I>(transports: I)
where
    I: IntoIterator,
    I::Item: IntoFuture,
{
    for transport in transports {
        let _ = transport.await;
    }
}

/// Variadic form of [`await_all`] for heterogeneous transports.
#[macro_export]
macro_rules! await_all {
    ($($transport:expr),+ $(,)?) => {{
        $( let _ = $transport.await; )+
    }};
}

/// Future returned by [`switch_to`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SwitchTo {
    target: ExecutorHandle,
    fired: bool,
}

/// Future returned by [`yield_now`].
#[derive(Debug, Default)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    fired: bool,
}

// === impl SwitchTo ===

impl Future for SwitchTo {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(());
        }
        this.fired = true;

        match task::current() {
            // the runner re-enqueues the task onto the target once this
            // poll has returned
            Some(task) => task.defer_to(Some(this.target.clone())),
            None => {
                let waker = cx.waker().clone();
                this.target.enqueue(move || waker.wake());
            }
        }
        Poll::Pending
    }
}

// === impl YieldNow ===

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(());
        }
        this.fired = true;

        match task::current() {
            Some(task) => task.defer_to(executor::current_executor()),
            None => cx.waker().wake_by_ref(),
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{
        ManualDrainExecutor, SingleThreadExecutor, current_executor, same_executor,
    };
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn on_executor(handle: &ExecutorHandle) -> bool {
        current_executor().is_some_and(|current| same_executor(&current, handle))
    }

    #[test]
    fn switch_to_lands_on_target() {
        let a = SingleThreadExecutor::new();
        let b = SingleThreadExecutor::new();
        let (tx, rx) = std::sync::mpsc::channel();

        let ha = a.handle();
        let hb = b.handle();
        let _done = spawn_value({
            let ha = ha.clone();
            let hb = hb.clone();
            async move {
                switch_to(&ha).await;
                tx.send(on_executor(&ha)).unwrap();
                switch_to(&hb).await;
                tx.send(on_executor(&hb)).unwrap();
            }
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn switch_to_same_executor_still_suspends() {
        let exec = ManualDrainExecutor::new();
        let order = Arc::new(AtomicUsize::new(0));

        let handle = exec.handle();
        let order2 = order.clone();
        let _done = spawn_value(async move {
            switch_to(&handle).await;
            order2.store(2, Ordering::Release);
        });

        // the coroutine parked itself in the queue rather than running
        // through
        assert_eq!(order.load(Ordering::Acquire), 0);
        exec.drain_once();
        assert_eq!(order.load(Ordering::Acquire), 2);
    }

    #[test]
    fn yield_requeues_behind_existing_tasks() {
        let exec = ManualDrainExecutor::new();
        let order = Arc::new(crate::sync::SpinMutex::new(Vec::new()));

        let handle = exec.handle();
        {
            let order = order.clone();
            let handle2 = handle.clone();
            handle.enqueue(move || {
                let between = order.clone();
                handle2.enqueue(move || between.lock().push("queued between"));
                // the yield must land *behind* the task queued above
                let task = crate::task::CoroTask::new(async move {
                    order.lock().push("first half");
                    yield_now().await;
                    order.lock().push("second half");
                });
                task.run();
            });
        }

        exec.drain_once();
        assert_eq!(
            *order.lock(),
            vec!["first half", "queued between", "second half"]
        );
    }

    #[test]
    fn await_all_over_a_collection() {
        let counter = Arc::new(AtomicUsize::new(0));
        let transports: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                spawn_value(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        // producers already ran eagerly; awaiting collects completion
        let gate = spawn_value(async move {
            await_all(transports).await;
        });
        assert!(gate.is_ready());
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn await_all_variadic() {
        let a = spawn(async { 1_u32 });
        let b = spawn_value(async { "two" });
        let gate = spawn_value(async move {
            await_all!(a, b);
        });
        assert!(gate.is_ready());
    }
}
