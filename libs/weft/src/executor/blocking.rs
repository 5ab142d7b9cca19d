// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::queue::{FifoQueue, TaskQueue};
use crate::executor::{Executor, ExecutorHandle, ExecutorScope, Task, run_task};
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::park::ParkingLot;
use crate::sync::SpinMutex;
use crate::task::{CatchUnwind, CoroTask};

/// An executor whose single worker is the thread that calls
/// [`block_on`][BlockingContext::block_on].
///
/// The target future is spawned as a runtime coroutine on the context, so
/// it may switch executors, await transports, and resume back here; the
/// calling thread keeps draining and parking until the coroutine finishes.
#[derive(Debug)]
pub struct BlockingContext {
    core: Arc<Core>,
}

#[derive(Debug)]
struct Core {
    running: AtomicBool,
    queue: FifoQueue,
    lot: ParkingLot,
}

// === impl Core ===

impl Core {
    fn run_until_stopped(&self) {
        loop {
            while let Some(task) = self.queue.get() {
                run_task(task);
            }
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            self.lot.park(|| self.queue.snapshot_not_empty());
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // ride the queue so the park/wake protocol covers a driver caught
        // between its drain and its park increment
        self.queue.add(Task::new(|| {}));
        self.lot.wake_one();
    }
}

impl Executor for Core {
    fn enqueue_task(&self, task: Task) {
        self.queue.add(task);
        self.lot.wake_one();
    }
}

/// Clears the run flag when the root coroutine finishes (or unwinds).
struct StopOnDrop {
    core: Arc<Core>,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.core.stop();
    }
}

// === impl BlockingContext ===

impl BlockingContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                running: AtomicBool::new(false),
                queue: FifoQueue::new(),
                lot: ParkingLot::new(),
            }),
        }
    }

    /// A shareable handle targeting this context.
    #[must_use]
    pub fn handle(&self) -> ExecutorHandle {
        self.core.clone()
    }

    /// Drives `future` to completion, using the calling thread as the
    /// context's worker until it finishes.
    ///
    /// # Panics
    ///
    /// Re-raises a panic captured from `future`.
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let _span = tracing::debug_span!("blocking context").entered();
        self.core.running.store(true, Ordering::Release);

        let outcome = Arc::new(SpinMutex::new(None));
        let root = {
            let outcome = outcome.clone();
            let stop = StopOnDrop {
                core: self.core.clone(),
            };
            CoroTask::new(async move {
                let _stop = stop;
                let result = CatchUnwind::new(future).await;
                *outcome.lock() = Some(result);
            })
        };

        // eager start with the register installed, exactly like a spawned
        // coroutine; the loop below picks up whatever the root leaves queued
        let _scope = ExecutorScope::enter(self.handle());
        root.run();
        self.core.run_until_stopped();

        let result = outcome
            .lock()
            .take()
            .expect("blocking context stopped before the root coroutine completed");
        match result {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

impl Default for BlockingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for BlockingContext {
    fn enqueue_task(&self, task: Task) {
        self.core.enqueue_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{spawn_value, switch_to, yield_now};
    use crate::executor::{SingleThreadExecutor, current_executor, same_executor};
    use crate::loom::sync::atomic::AtomicUsize;

    #[test]
    fn drives_a_ready_future() {
        let mut ctx = BlockingContext::new();
        assert_eq!(ctx.block_on(async { 42 }), 42);
    }

    #[test]
    fn is_reusable() {
        let mut ctx = BlockingContext::new();
        assert_eq!(ctx.block_on(async { 1 }), 1);
        assert_eq!(ctx.block_on(async { 2 }), 2);
    }

    #[test]
    fn installs_the_register() {
        let mut ctx = BlockingContext::new();
        let handle = ctx.handle();
        let on_ctx = ctx.block_on(async move {
            current_executor().is_some_and(|current| same_executor(&current, &handle))
        });
        assert!(on_ctx);
    }

    #[test]
    fn root_may_roam_and_return() {
        let other = SingleThreadExecutor::new();
        let mut ctx = BlockingContext::new();

        let home = ctx.handle();
        let away = other.handle();
        let value = ctx.block_on(async move {
            switch_to(&away).await;
            let on_away = current_executor().is_some_and(|c| same_executor(&c, &away));
            switch_to(&home).await;
            let on_home = current_executor().is_some_and(|c| same_executor(&c, &home));
            (on_away, on_home)
        });
        assert_eq!(value, (true, true));
    }

    #[test]
    fn awaits_transports_completed_elsewhere() {
        let other = SingleThreadExecutor::new();
        let mut ctx = BlockingContext::new();

        let away = other.handle();
        let produced = spawn_value(async move {
            switch_to(&away).await;
            21_u32
        });

        let value = ctx.block_on(async move { produced.await * 2 });
        assert_eq!(value, 42);
    }

    #[test]
    fn drains_queued_tasks_while_waiting() {
        let mut ctx = BlockingContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = ctx.handle();
        let counter2 = counter.clone();
        let total = ctx.block_on(async move {
            for _ in 0..10 {
                let counter = counter2.clone();
                handle.enqueue(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            // let the queued tasks run before reading
            yield_now().await;
            counter2.load(Ordering::Relaxed)
        });
        assert_eq!(total, 10);
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn root_panic_is_resumed_on_the_caller() {
        let mut ctx = BlockingContext::new();
        let caught = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| {
            ctx.block_on(async {
                panic!("root failed");
            })
        }));
        let payload = caught.expect_err("panic must reach the caller");
        assert_eq!(
            crate::error::panic_message(&*payload),
            "root failed"
        );
    }
}
