// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A composable concurrency substrate: executors that schedule small
//! non-blocking work items across threads, coroutine value transports that
//! bridge producers to awaiters with an executor-aware resume policy, and a
//! future/promise transport linking blocking producers to blocking waiters
//! or asynchronous continuations.
//!
//! ```
//! use weft::coro::{spawn_value, switch_to};
//! use weft::executor::{BlockingContext, SingleThreadExecutor};
//!
//! let pool = SingleThreadExecutor::new();
//! let worker = pool.handle();
//!
//! let answer = spawn_value(async move {
//!     switch_to(&worker).await;
//!     6 * 7
//! });
//!
//! let mut ctx = BlockingContext::new();
//! assert_eq!(ctx.block_on(async move { answer.await }), 42);
//! ```

mod error;
pub mod executor;
pub mod coro;
pub(crate) mod loom;
pub(crate) mod park;
pub mod promise;
pub mod sync;
pub(crate) mod task;

pub use error::{FutureError, FutureErrorKind};
pub use executor::{Executor, ExecutorHandle, Task, current_executor, same_executor};
