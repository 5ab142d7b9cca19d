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
use crate::loom::thread;
use crate::park::ParkingLot;

/// An executor owning exactly one worker thread over a FIFO queue.
///
/// Tasks enqueued by a single thread run in enqueue order. Dropping the
/// executor drains everything enqueued before the drop, then joins the
/// worker.
#[derive(Debug)]
pub struct SingleThreadExecutor {
    core: Arc<Core>,
    worker: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct Core {
    running: AtomicBool,
    queue: FifoQueue,
    lot: ParkingLot,
}

// === impl Core ===

impl Core {
    fn worker_loop(self: &Arc<Self>) {
        let _scope = ExecutorScope::enter(self.clone() as ExecutorHandle);
        let _span = tracing::debug_span!("single-thread worker").entered();

        loop {
            self.drain();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.lot.park(|| self.queue.snapshot_not_empty());
        }
        tracing::debug!("worker shutting down");
    }

    fn drain(&self) {
        while let Some(task) = self.queue.get() {
            run_task(task);
        }
    }
}

impl Executor for Core {
    fn enqueue_task(&self, task: Task) {
        self.queue.add(task);
        self.lot.wake_one();
    }
}

// === impl SingleThreadExecutor ===

impl SingleThreadExecutor {
    #[must_use]
    pub fn new() -> Self {
        let core = Arc::new(Core {
            running: AtomicBool::new(true),
            queue: FifoQueue::new(),
            lot: ParkingLot::new(),
        });

        let worker = {
            let core = core.clone();
            thread::Builder::new()
                .name("weft-worker".into())
                .spawn(move || core.worker_loop())
                .expect("failed to spawn worker thread")
        };

        Self {
            core,
            worker: Some(worker),
        }
    }

    /// A shareable handle targeting this executor.
    #[must_use]
    pub fn handle(&self) -> ExecutorHandle {
        self.core.clone()
    }
}

impl Default for SingleThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SingleThreadExecutor {
    fn enqueue_task(&self, task: Task) {
        self.core.enqueue_task(task);
    }
}

impl Drop for SingleThreadExecutor {
    fn drop(&mut self) {
        // the stop marker rides the queue behind every previously enqueued
        // task, so the worker drains them all before it observes the flag
        let core = self.core.clone();
        self.core.enqueue_task(Task::new(move || {
            core.running.store(false, Ordering::Release);
        }));

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        // tasks racing in behind the stop marker are cancelled
        while self.core.queue.get().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{current_executor, same_executor};
    use crate::loom;
    use crate::loom::sync::atomic::AtomicUsize;

    #[test]
    fn runs_every_task_before_shutdown() {
        loom::model(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let total = if cfg!(loom) { 3 } else { 100_000 };

            {
                let exec = SingleThreadExecutor::new();
                for _ in 0..total {
                    let counter = counter.clone();
                    exec.handle().enqueue(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }

            assert_eq!(counter.load(Ordering::Relaxed), total);
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn single_producer_order_is_preserved() {
        let order = Arc::new(crate::sync::SpinMutex::new(Vec::new()));

        {
            let exec = SingleThreadExecutor::new();
            for n in 0..1000 {
                let order = order.clone();
                exec.handle().enqueue(move || order.lock().push(n));
            }
        }

        assert_eq!(*order.lock(), (0..1000).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn register_points_at_owner() {
        let exec = SingleThreadExecutor::new();
        let handle = exec.handle();
        let (tx, rx) = std::sync::mpsc::channel();

        let probe = handle.clone();
        handle.enqueue(move || {
            let current = current_executor().expect("worker must install the register");
            let _ = tx.send(same_executor(&current, &probe));
        });

        assert!(rx.recv().unwrap());
        assert!(current_executor().is_none());
    }
}
