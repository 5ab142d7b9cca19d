// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::{self, ExecutorHandle};
use crate::task::{self, CoroTask};
use crate::loom::sync::Arc;
use core::task::{Context, Waker};

/// A suspended consumer registered with a value transport.
///
/// Runtime coroutines are recorded together with the executor they were
/// captured on (and an optional explicit target from `configure`), which is
/// what allows the producer to choose between resuming in place and hopping
/// executors. Foreign consumers (futures driven by some other runtime)
/// are recorded by their [`Waker`]; their runtime decides placement.
#[derive(Debug)]
pub(crate) struct Awaiter {
    waiter: Waiter,
    captured: Option<ExecutorHandle>,
    target: Option<ExecutorHandle>,
}

enum Waiter {
    Task(Arc<CoroTask>),
    Waker(Waker),
}

// === impl Awaiter ===

impl Awaiter {
    /// Captures the consumer suspending at this await point.
    pub(crate) fn capture(target: Option<ExecutorHandle>, cx: &mut Context<'_>) -> Self {
        match task::current() {
            Some(task) => Self {
                waiter: Waiter::Task(task),
                captured: executor::current_executor(),
                target,
            },
            None => Self {
                waiter: Waiter::Waker(cx.waker().clone()),
                captured: None,
                target: None,
            },
        }
    }

    /// Replaces the stored waker with the one of the latest poll. A no-op
    /// for runtime-coroutine records, which are resumed through the task
    /// itself rather than a waker.
    pub(crate) fn refresh_waker(&mut self, waker: &Waker) {
        if let Waiter::Waker(current) = &mut self.waiter
            && !waker.will_wake(current)
        {
            *current = waker.clone();
        }
    }

    /// Resumes the consumer, consuming the record. The effective destination
    /// is the explicit target if configured, else the captured executor; the
    /// resume happens on the current thread when the destination is absent
    /// or is the executor of the calling thread, and via the destination's
    /// queue otherwise.
    pub(crate) fn dispatch(self) {
        match self.waiter {
            Waiter::Waker(waker) => waker.wake(),
            Waiter::Task(task) => {
                let dest = self.target.or(self.captured);
                match dest {
                    Some(exec) if !executor::is_current(&exec) => task.dispatch(Some(exec)),
                    _ => task.dispatch(None),
                }
            }
        }
    }
}

/// Whether an await point that found its transport already completed may
/// take the value on the current thread, or has to hop to `target` first.
pub(crate) fn allow_inline(target: Option<&ExecutorHandle>) -> bool {
    match target {
        None => true,
        Some(exec) => executor::is_current(exec),
    }
}

impl core::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Waiter::Task(_) => f.write_str("Waiter::Task"),
            Waiter::Waker(_) => f.write_str("Waiter::Waker"),
        }
    }
}
