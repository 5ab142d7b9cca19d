// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executors: objects that accept [`Task`]s and run them on threads they own.
//!
//! All variants share one narrow capability, [`Executor::enqueue_task`],
//! behind which they differ in queueing discipline and thread ownership:
//!
//! - [`SingleThreadExecutor`]: one owned worker, FIFO order.
//! - [`ScalingExecutor`]: a pool growing and shrinking between a configured
//!   `min` and `max`, over either a FIFO or an unordered bag queue.
//! - [`BlockingContext`]: the calling thread becomes the worker until a
//!   target future completes.
//! - [`ManualDrainExecutor`]: owns no threads; the caller drains it.
//!
//! While a worker runs an executor's loop, the executor is installed in a
//! thread-local register readable through [`current_executor`]; awaitables
//! use it to decide between resuming in place and hopping executors.

mod blocking;
mod manual;
pub mod queue;
mod scaling;
mod single_thread;

pub use blocking::BlockingContext;
pub use manual::ManualDrainExecutor;
pub use scaling::{ScalingBagExecutor, ScalingConfig, ScalingExecutor, ScalingFifoExecutor};
pub use single_thread::SingleThreadExecutor;

use crate::loom::sync::Arc;
use core::cell::RefCell;
use core::fmt;
use static_assertions::assert_impl_all;

/// An opaque, self-owning work item.
///
/// The wrapped callable is invoked at most once and releases its own storage
/// on invocation (or on drop, for tasks cancelled at executor shutdown).
/// Tasks must not panic; a panic that escapes one is a contract violation
/// which the worker contains and logs.
pub struct Task(Box<dyn FnOnce() + Send + 'static>);

/// The capability every executor variant exposes.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Accepts a task for execution on whatever thread(s) this executor
    /// owns. Never blocks beyond a brief internal spin.
    fn enqueue_task(&self, task: Task);
}

/// A shared, type-erased executor reference.
///
/// Handles are cheap to clone and compare by identity (the pointed-to
/// executor), which is what the resume-in-place policy needs.
pub type ExecutorHandle = Arc<dyn Executor>;

assert_impl_all!(ExecutorHandle: Send, Sync);

// === impl Task ===

impl Task {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Invokes the task, consuming it.
    #[inline]
    pub fn run(self) {
        (self.0)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

// === impl dyn Executor ===

impl dyn Executor {
    /// Wraps a nullary callable as a [`Task`] and enqueues it.
    pub fn enqueue(&self, f: impl FnOnce() + Send + 'static) {
        self.enqueue_task(Task::new(f));
    }
}

// === current-executor register ===

std::thread_local! {
    static CURRENT_EXECUTOR: RefCell<Option<ExecutorHandle>> = const { RefCell::new(None) };
}

/// Returns the executor owning the calling thread, if any.
///
/// Set for the duration of a worker loop (or a manual drain); `None` on
/// threads no executor owns.
pub fn current_executor() -> Option<ExecutorHandle> {
    CURRENT_EXECUTOR.with(|current| current.borrow().clone())
}

/// `true` when `handle` is the executor owning the calling thread.
pub fn is_current(handle: &ExecutorHandle) -> bool {
    CURRENT_EXECUTOR.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|cur| same_executor(cur, handle))
    })
}

/// Identity comparison of two executor handles.
pub fn same_executor(a: &ExecutorHandle, b: &ExecutorHandle) -> bool {
    Arc::ptr_eq(a, b)
}

/// Installs `handle` in the current-executor register for the guard's
/// lifetime, restoring the previous value on drop so nested drains behave.
pub(crate) struct ExecutorScope {
    prev: Option<ExecutorHandle>,
}

impl ExecutorScope {
    pub(crate) fn enter(handle: ExecutorHandle) -> Self {
        let prev = CURRENT_EXECUTOR.with(|current| current.borrow_mut().replace(handle));
        Self { prev }
    }
}

impl Drop for ExecutorScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_EXECUTOR.with(|current| {
            *current.borrow_mut() = prev;
        });
    }
}

/// Runs a task, containing contract-violating panics so a worker thread
/// survives them.
pub(crate) fn run_task(task: Task) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run())) {
        tracing::error!(
            panic = %crate::error::panic_message(&*payload),
            "task panicked; tasks must not panic",
        );
    }
}
