// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::queue::{FifoQueue, TaskQueue};
use crate::executor::{Executor, ExecutorHandle, ExecutorScope, Task, run_task};
use crate::loom::sync::Arc;

/// An executor that owns no threads: enqueued tasks sit in its queue until
/// the caller drains them.
///
/// Intended for deterministic tests and cooperative embeddings where the
/// host decides when runtime work may happen.
#[derive(Debug)]
pub struct ManualDrainExecutor {
    core: Arc<Core>,
}

#[derive(Debug)]
struct Core {
    queue: FifoQueue,
}

impl Executor for Core {
    fn enqueue_task(&self, task: Task) {
        self.queue.add(task);
    }
}

// === impl ManualDrainExecutor ===

impl ManualDrainExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                queue: FifoQueue::new(),
            }),
        }
    }

    /// A shareable handle targeting this executor.
    #[must_use]
    pub fn handle(&self) -> ExecutorHandle {
        self.core.clone()
    }

    /// Installs the current-executor register and consumes every task that
    /// is available at the time of the call (including tasks those tasks
    /// enqueue back onto this executor).
    pub fn drain_once(&self) {
        let _scope = ExecutorScope::enter(self.handle());
        while let Some(task) = self.core.queue.get() {
            run_task(task);
        }
    }
}

impl Default for ManualDrainExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ManualDrainExecutor {
    fn enqueue_task(&self, task: Task) {
        self.core.enqueue_task(task);
    }
}
