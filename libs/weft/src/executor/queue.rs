// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task stores backing the executor variants.
//!
//! Two disciplines: [`FifoQueue`] preserves insertion order behind a single
//! spin lock, [`BagQueue`] trades ordering for sharded multi-producer/
//! multi-consumer throughput. Both smooth out brief producer/consumer races
//! by spinning shortly in [`TaskQueue::get`] before reporting empty; the
//! remaining race between "queue empties" and "worker parks" is closed by
//! the snapshot-plus-signal protocol in [`crate::park`].

use crate::executor::Task;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{CachePadded, SpinMutex, SpinWait};
use std::collections::VecDeque;

/// Rounds of backoff spinning `get` performs before giving up on an
/// apparently empty queue.
const SPINS_BEFORE_EMPTY: usize = 4;

/// Shard count of the bag queue; power of two so ticket masking is cheap.
const BAG_SHARDS: usize = 8;

/// The semantic container of tasks shared between producers and workers.
pub trait TaskQueue: Send + Sync + core::fmt::Debug + 'static {
    /// Adds a task. Never fails, never blocks beyond a brief spin.
    fn add(&self, task: Task);

    /// Removes a task if one is available "soon": performs a short bounded
    /// spin before returning `None` to smooth out add/get races.
    fn get(&self) -> Option<Task>;

    /// Best-effort emptiness observation. A `true` result after a completed
    /// `add` means the item is visible to some consumer; no other ordering
    /// is implied.
    fn snapshot_not_empty(&self) -> bool;
}

/// Strictly ordered task store: a spin lock around a deque, plus an atomic
/// length so the snapshot never takes the lock.
#[derive(Debug, Default)]
pub struct FifoQueue {
    len: CachePadded<AtomicUsize>,
    tasks: SpinMutex<VecDeque<Task>>,
}

/// Unordered task store: tasks are spread over cache-padded shards by a
/// round-robin ticket, consumers scan the shards from a rotating start
/// offset. Strict ordering is not promised, only progress.
#[derive(Debug)]
pub struct BagQueue {
    len: CachePadded<AtomicUsize>,
    add_ticket: CachePadded<AtomicUsize>,
    get_ticket: CachePadded<AtomicUsize>,
    shards: [CachePadded<SpinMutex<VecDeque<Task>>>; BAG_SHARDS],
}

// === impl FifoQueue ===

impl FifoQueue {
    pub fn new() -> Self {
        Self {
            len: CachePadded(AtomicUsize::new(0)),
            tasks: SpinMutex::new(VecDeque::new()),
        }
    }

    fn pop(&self) -> Option<Task> {
        let task = self.tasks.lock().pop_front();
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Release);
        }
        task
    }
}

impl TaskQueue for FifoQueue {
    fn add(&self, task: Task) {
        self.tasks.lock().push_back(task);
        self.len.fetch_add(1, Ordering::Release);
    }

    fn get(&self) -> Option<Task> {
        if let Some(task) = self.pop() {
            return Some(task);
        }
        let mut spinner = SpinWait::new();
        for _ in 0..SPINS_BEFORE_EMPTY {
            spinner.spin_once();
            if let Some(task) = self.pop() {
                return Some(task);
            }
        }
        None
    }

    fn snapshot_not_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) != 0
    }
}

// === impl BagQueue ===

impl BagQueue {
    pub fn new() -> Self {
        Self {
            len: CachePadded(AtomicUsize::new(0)),
            add_ticket: CachePadded(AtomicUsize::new(0)),
            get_ticket: CachePadded(AtomicUsize::new(0)),
            shards: core::array::from_fn(|_| CachePadded(SpinMutex::new(VecDeque::new()))),
        }
    }

    fn scan(&self, start: usize) -> Option<Task> {
        for i in 0..BAG_SHARDS {
            let shard = &self.shards[(start + i) % BAG_SHARDS];
            // skip shards another consumer is busy with on the first pass
            if let Some(mut tasks) = shard.try_lock()
                && let Some(task) = tasks.pop_front()
            {
                self.len.fetch_sub(1, Ordering::Release);
                return Some(task);
            }
        }
        for i in 0..BAG_SHARDS {
            let shard = &self.shards[(start + i) % BAG_SHARDS];
            if let Some(task) = shard.lock().pop_front() {
                self.len.fetch_sub(1, Ordering::Release);
                return Some(task);
            }
        }
        None
    }
}

impl Default for BagQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue for BagQueue {
    fn add(&self, task: Task) {
        let shard = self.add_ticket.fetch_add(1, Ordering::Relaxed) % BAG_SHARDS;
        self.shards[shard].lock().push_back(task);
        self.len.fetch_add(1, Ordering::Release);
    }

    fn get(&self) -> Option<Task> {
        let start = self.get_ticket.fetch_add(1, Ordering::Relaxed) % BAG_SHARDS;
        if let Some(task) = self.scan(start) {
            return Some(task);
        }
        let mut spinner = SpinWait::new();
        for _ in 0..SPINS_BEFORE_EMPTY {
            spinner.spin_once();
            if self.len.load(Ordering::Acquire) != 0
                && let Some(task) = self.scan(start)
            {
                return Some(task);
            }
        }
        None
    }

    fn snapshot_not_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) != 0
    }
}
