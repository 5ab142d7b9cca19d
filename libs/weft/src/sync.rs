// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization building blocks: a spin lock, a bounded
//! spin-then-yield wait helper, and cache-line padding.

mod cache_padded;
mod spin;
mod spin_wait;

pub use cache_padded::CachePadded;
pub use spin::{SpinMutex, SpinMutexGuard};
pub use spin_wait::SpinWait;
