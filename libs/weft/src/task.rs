// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime task core: the unit the value transports suspend and resume.
//!
//! A [`CoroTask`] owns a spawned coroutine (a boxed future) and drives it
//! through a small atomic lifecycle that makes wakeups idempotent and rules
//! out concurrent polls:
//!
//! ```text
//! SCHEDULED ──run──► RUNNING ──Ready──► COMPLETE
//!     ▲                │  ▲
//!     │             Pending │ (NOTIFIED: woken mid-poll, repoll)
//!     └──dispatch── IDLE ◄──┘
//! ```
//!
//! While a task is being polled it is installed in a thread-local register;
//! transports read it to build awaiter records, which is what lets a
//! producer resume an awaiting coroutine either in place or via an executor
//! queue. A deferred-reschedule slot carries executor switches: the awaitable
//! records the destination during the poll and the runner re-enqueues the
//! task only after the poll has returned, so a still-running task is never
//! visible in a queue.

use crate::executor::{self, ExecutorHandle};
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicU8, Ordering};
use crate::sync::SpinMutex;
use core::any::Any;
use core::cell::RefCell;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use pin_project::pin_project;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::task::Wake;

const SCHEDULED: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const IDLE: u8 = 3;
const COMPLETE: u8 = 4;

/// A reference-counted coroutine driver.
///
/// Created in the `SCHEDULED` state; the creator must hand it to `run`
/// (eager start) or an executor exactly once.
pub(crate) struct CoroTask {
    state: AtomicU8,
    future: SpinMutex<Option<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>>,
    /// The executor this task last polled on; wakes through the `Waker`
    /// surface re-enqueue here.
    home: SpinMutex<Option<ExecutorHandle>>,
    /// Destination recorded by a switch/yield awaitable during the poll,
    /// consumed by the runner after the poll returns. `Some(None)` means
    /// "re-run on this thread".
    deferred: SpinMutex<Option<Option<ExecutorHandle>>>,
}

std::thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<CoroTask>>> = const { RefCell::new(None) };
}

/// The task currently being polled on this thread, if any.
pub(crate) fn current() -> Option<Arc<CoroTask>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

struct TaskScope {
    prev: Option<Arc<CoroTask>>,
}

impl TaskScope {
    fn enter(task: Arc<CoroTask>) -> Self {
        let prev = CURRENT_TASK.with(|current| current.borrow_mut().replace(task));
        Self { prev }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|current| {
            *current.borrow_mut() = prev;
        });
    }
}

// === impl CoroTask ===

impl CoroTask {
    pub(crate) fn new(future: impl Future<Output = ()> + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(SCHEDULED),
            future: SpinMutex::new(Some(Box::pin(future))),
            home: SpinMutex::new(None),
            deferred: SpinMutex::new(None),
        })
    }

    /// Wakes the task: schedules a poll on `dest`, or runs it on the calling
    /// thread when `dest` is `None`. Idempotent while a poll is pending; a
    /// wake that lands mid-poll turns into an immediate repoll.
    pub(crate) fn dispatch(self: &Arc<Self>, dest: Option<ExecutorHandle>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                // already scheduled, already notified, or done
                _ => return,
            }
        }

        match dest {
            None => self.run(),
            Some(exec) => {
                tracing::trace!("rescheduling task onto target executor");
                let task = self.clone();
                exec.enqueue(move || task.run());
            }
        }
    }

    /// Records an executor switch to apply once the in-progress poll
    /// returns. Must only be called from the future this task is polling.
    pub(crate) fn defer_to(&self, dest: Option<ExecutorHandle>) {
        *self.deferred.lock() = Some(dest);
    }

    /// Polls the coroutine until it suspends or completes.
    pub(crate) fn run(self: &Arc<Self>) {
        if self.state.swap(RUNNING, Ordering::AcqRel) == COMPLETE {
            self.state.store(COMPLETE, Ordering::Release);
            return;
        }

        loop {
            let poll = {
                let _scope = TaskScope::enter(self.clone());
                *self.home.lock() = executor::current_executor();

                let mut slot = self.future.lock();
                let Some(future) = slot.as_mut() else {
                    self.state.store(COMPLETE, Ordering::Release);
                    return;
                };
                let waker = Waker::from(self.clone());
                let mut cx = Context::from_waker(&waker);
                catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
            };

            match poll {
                Ok(Poll::Ready(())) => {
                    *self.future.lock() = None;
                    self.state.store(COMPLETE, Ordering::Release);
                    return;
                }
                Err(payload) => {
                    // spawned coroutines capture their own panics; one that
                    // unwinds out of the root poll violated that contract
                    tracing::error!(
                        panic = %crate::error::panic_message(&*payload),
                        "runtime task panicked outside a capture point",
                    );
                    *self.future.lock() = None;
                    self.state.store(COMPLETE, Ordering::Release);
                    return;
                }
                Ok(Poll::Pending) => {
                    if let Some(dest) = self.deferred.lock().take() {
                        self.state.store(SCHEDULED, Ordering::Release);
                        match dest {
                            Some(exec) => {
                                let task = self.clone();
                                exec.enqueue(move || task.run());
                                return;
                            }
                            // yield on a thread no executor owns: just
                            // poll again
                            None => continue,
                        }
                    }
                    match self.state.compare_exchange(
                        RUNNING,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(_notified) => {
                            self.state.store(RUNNING, Ordering::Release);
                            continue;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }
}

impl Wake for CoroTask {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let home = self.home.lock().clone();
        self.dispatch(home);
    }
}

// === impl CatchUnwind ===

/// Wraps a future, converting a panic during any poll into a captured
/// payload. The spawn wrappers use it to route producer panics into the
/// transports instead of unwinding a worker.
#[pin_project]
pub(crate) struct CatchUnwind<F> {
    #[pin]
    future: F,
}

impl<F> CatchUnwind<F> {
    pub(crate) fn new(future: F) -> Self {
        Self { future }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut future = this.future;
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}
