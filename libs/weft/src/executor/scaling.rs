// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::queue::{BagQueue, FifoQueue, TaskQueue};
use crate::executor::{Executor, ExecutorHandle, ExecutorScope, Task, run_task};
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Mutex};
use crate::loom::thread;
use crate::park::{ParkTimeout, ParkingLot};
use crate::sync::SpinMutex;
use core::time::Duration;

/// Sizing policy of a [`ScalingExecutor`].
#[derive(Debug, Clone, Copy)]
pub struct ScalingConfig {
    min: usize,
    max: usize,
    linger: Duration,
}

/// A pool executor that grows towards `max` workers under backlog and
/// shrinks back towards `min` once workers sit idle for the configured
/// linger duration.
///
/// The queueing discipline is pluggable: [`ScalingFifoExecutor`] preserves
/// per-producer enqueue order, [`ScalingBagExecutor`] spreads tasks over
/// shards and promises only progress.
#[derive(Debug)]
pub struct ScalingExecutor<Q: TaskQueue> {
    core: Arc<Core<Q>>,
}

/// Scaling pool over the ordered queue.
pub type ScalingFifoExecutor = ScalingExecutor<FifoQueue>;
/// Scaling pool over the unordered bag queue.
pub type ScalingBagExecutor = ScalingExecutor<BagQueue>;

#[derive(Debug)]
struct Core<Q> {
    running: AtomicBool,
    queue: Q,
    lot: ParkingLot,
    live: AtomicUsize,
    config: ScalingConfig,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Strong self-reference so the enqueue path can hand new workers an
    /// owning reference. Cleared during shutdown to break the cycle.
    me: SpinMutex<Option<Arc<Core<Q>>>>,
}

// === impl ScalingConfig ===

impl ScalingConfig {
    /// # Panics
    ///
    /// Panics unless `min <= max` and `max > 0`.
    #[must_use]
    pub fn new(min: usize, max: usize, linger: Duration) -> Self {
        assert!(min <= max, "scaling executor requires min <= max");
        assert!(max > 0, "scaling executor requires at least one worker slot");
        Self { min, max, linger }
    }

    #[must_use]
    pub fn min(&self) -> usize {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    #[must_use]
    pub fn linger(&self) -> Duration {
        self.linger
    }
}

// === impl Core ===

impl<Q: TaskQueue> Core<Q> {
    fn worker_loop(self: &Arc<Self>) {
        let _scope = ExecutorScope::enter(self.clone() as ExecutorHandle);
        let _span = tracing::debug_span!("pool worker").entered();

        let retired = loop {
            self.drain();
            if !self.running.load(Ordering::Acquire) {
                break false;
            }
            if !self.rest() {
                break true;
            }
        };

        if !retired {
            // shutdown path; retirement already gave the live slot back
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!(retired, "worker exiting");
    }

    fn drain(&self) {
        while let Some(task) = self.queue.get() {
            run_task(task);
        }
    }

    /// Parks until woken or the linger elapses. Returns `false` when the
    /// worker retired (and already gave up its live slot).
    fn rest(&self) -> bool {
        match self
            .lot
            .park_timeout(|| self.queue.snapshot_not_empty(), self.config.linger)
        {
            ParkTimeout::Woken | ParkTimeout::Claimed => true,
            ParkTimeout::TimedOut => !self.try_retire(),
        }
    }

    /// Gives up this worker's live slot if the pool stays at or above the
    /// configured floor.
    fn try_retire(&self) -> bool {
        loop {
            let live = self.live.load(Ordering::Acquire);
            if live <= self.config.min {
                return false;
            }
            if self
                .live
                .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let core = self.clone();
        let handle = thread::Builder::new()
            .name("weft-pool-worker".into())
            .spawn(move || core.worker_loop())
            .expect("failed to spawn worker thread");
        self.workers.lock().unwrap().push(handle);
        tracing::debug!(live = self.live.load(Ordering::Relaxed), "spawned worker");
    }

    /// Grows the pool by one worker when the pool is below `max` and backlog
    /// is observable. Called only after `wake_one` found nobody parked.
    fn try_spawn(&self) {
        let Some(me) = self.me.lock().clone() else {
            // shutting down
            return;
        };
        loop {
            if !self.running.load(Ordering::Acquire) || !self.queue.snapshot_not_empty() {
                return;
            }
            let live = self.live.load(Ordering::Acquire);
            if live >= self.config.max {
                return;
            }
            if self
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                me.spawn_worker();
                return;
            }
        }
    }
}

impl<Q: TaskQueue> Executor for Core<Q> {
    fn enqueue_task(&self, task: Task) {
        self.queue.add(task);
        if !self.lot.wake_one() {
            self.try_spawn();
        }
    }
}

// === impl ScalingExecutor ===

impl<Q: TaskQueue> ScalingExecutor<Q> {
    fn with_queue(queue: Q, config: ScalingConfig) -> Self {
        let core = Arc::new(Core {
            running: AtomicBool::new(true),
            queue,
            lot: ParkingLot::new(),
            live: AtomicUsize::new(config.min),
            config,
            workers: Mutex::new(Vec::new()),
            me: SpinMutex::new(None),
        });
        *core.me.lock() = Some(core.clone());

        for _ in 0..config.min {
            core.spawn_worker();
        }

        Self { core }
    }

    /// A shareable handle targeting this executor.
    #[must_use]
    pub fn handle(&self) -> ExecutorHandle {
        self.core.clone()
    }

    /// Number of live workers; always within `[min, max]`.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.core.live.load(Ordering::Acquire)
    }
}

impl ScalingExecutor<FifoQueue> {
    #[must_use]
    pub fn new(config: ScalingConfig) -> Self {
        Self::with_queue(FifoQueue::new(), config)
    }
}

impl ScalingExecutor<BagQueue> {
    #[must_use]
    pub fn new(config: ScalingConfig) -> Self {
        Self::with_queue(BagQueue::new(), config)
    }
}

impl<Q: TaskQueue> Executor for ScalingExecutor<Q> {
    fn enqueue_task(&self, task: Task) {
        self.core.enqueue_task(task);
    }
}

impl<Q: TaskQueue> Drop for ScalingExecutor<Q> {
    fn drop(&mut self) {
        self.core.running.store(false, Ordering::Release);

        // keep waking until every worker has observed the flag; a worker
        // caught between its drain and its park increment would otherwise
        // miss a single wake-all
        while self.core.live.load(Ordering::Acquire) != 0 {
            self.core.lot.wake_all();
            thread::yield_now();
        }

        let workers = core::mem::take(&mut *self.core.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }

        // break the self-reference cycle, then cancel anything that raced in
        // behind the stop flag
        *self.core.me.lock() = None;
        while self.core.queue.get().is_some() {}
        tracing::debug!("scaling executor shut down");
    }
}
