// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The future/promise transport: value delivery across threads with
//! blocking retrieval and chained continuations.
//!
//! The shared state packs its entire lifecycle into one atomic word: three
//! low bits (an ancillary spin lock, a write-in-progress claim, a ready
//! flag) and, in the remaining bits, a tagged pointer to a lazily installed
//! mutex/condvar pair that only materializes once somebody blocks.
//!
//! Lifecycle: a producer claims the write bit (losing the claim is
//! [`PromiseAlreadySatisfied`]), publishes, sets ready, and hands off the
//! registered continuation. A consumer's [`get`][Future::get] clears the
//! write bit again (the consumed marker), so a second retrieval reports
//! [`FutureAlreadyRetrieved`]. A promise dropped unpublished finalizes the
//! state with [`BrokenPromise`] so waiters fail instead of blocking
//! forever.
//!
//! [`PromiseAlreadySatisfied`]: FutureErrorKind::PromiseAlreadySatisfied
//! [`FutureAlreadyRetrieved`]: FutureErrorKind::FutureAlreadyRetrieved
//! [`BrokenPromise`]: FutureErrorKind::BrokenPromise

use crate::error::{FutureError, FutureErrorKind};
use crate::executor::{self, ExecutorHandle};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Condvar, Mutex};
use crate::sync::SpinWait;
use bitflags::bitflags;
use core::any::Any;
use core::ptr;
use core::time::Duration;
use std::panic::{AssertUnwindSafe, catch_unwind};

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    struct LockWord: usize {
        /// Ancillary short lock (sync-pair installation, consumption).
        const SPIN = 0b001;
        /// A producer claimed the right to publish. Doubles as the
        /// not-yet-consumed marker once READY is set.
        const WRITE = 0b010;
        /// Publication complete.
        const READY = 0b100;
    }
}

const FLAG_MASK: usize = 0b111;

/// How an installed continuation is invoked relative to the completion.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ContinuationFlag {
    /// Invoke at the producer's completion site, on the producer's thread
    /// (or on the installer's thread when the state was already satisfied).
    OnCompletion,
    /// Always redispatch onto the captured (or explicitly given) executor.
    ForceAsync,
    /// Direct when installed before satisfaction (the producer invokes it
    /// at completion); redispatched when installed after, so the installer
    /// does not pay for it.
    AsyncIfDistant,
}

/// The producing half. Move-only; dropping it unpublished breaks the
/// promise.
pub struct Promise<T> {
    state: Arc<SharedState<T>>,
}

/// The consuming half, obtained from [`Promise::get_future`]. A
/// default-constructed `Future` has no state; its operations report
/// [`FutureErrorKind::NoState`].
pub struct Future<T> {
    state: Option<Arc<SharedState<T>>>,
}

struct SharedState<T> {
    word: AtomicUsize,
    outcome: UnsafeCell<Option<Outcome<T>>>,
    continuation: AtomicPtr<Continuation>,
}

enum Outcome<T> {
    Value(T),
    Error(FutureErrorKind),
    Panicked(Box<dyn Any + Send>),
}

/// Lazily allocated blocking support, tag-pointed to from the state word.
#[repr(align(8))]
struct SyncPair {
    mutex: Mutex<()>,
    cv: Condvar,
}

struct Continuation {
    flag: ContinuationFlag,
    context: Option<ExecutorHandle>,
    run: Box<dyn FnOnce() + Send>,
}

// Safety: the word's claim/consume protocol serializes every access to the
// outcome cell (producer before READY, the single winning consumer after)
unsafe impl<T: Send> Send for SharedState<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for SharedState<T> {}

// === impl Continuation ===

impl Continuation {
    fn new(flag: ContinuationFlag, context: Option<ExecutorHandle>, run: Box<dyn FnOnce() + Send>) -> Self {
        // the completion-site flavor never leaves the completing thread, so
        // only the async-capable flavors capture a context
        let context = match flag {
            ContinuationFlag::OnCompletion => None,
            _ => context.or_else(executor::current_executor),
        };
        Self { flag, context, run }
    }

    fn run_inline(self) {
        (self.run)();
    }

    fn run_async(self) {
        match self.context {
            Some(exec) => {
                let run = self.run;
                exec.enqueue(move || run());
            }
            // no context was available at install time; nothing to hop to
            None => (self.run)(),
        }
    }

    /// Dispatch at the producer's completion site.
    fn on_completion(self) {
        match self.flag {
            ContinuationFlag::ForceAsync => self.run_async(),
            _ => self.run_inline(),
        }
    }

    /// Dispatch for an installation that found the state already satisfied.
    fn on_already_fulfilled(self) {
        match self.flag {
            ContinuationFlag::OnCompletion => self.run_inline(),
            _ => self.run_async(),
        }
    }
}

// === impl SharedState ===

impl<T> SharedState<T> {
    fn new() -> Self {
        Self {
            word: AtomicUsize::new(0),
            outcome: UnsafeCell::new(None),
            continuation: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn satisfied_sentinel() -> *mut Continuation {
        ptr::without_provenance_mut(usize::MAX)
    }

    fn flags(&self) -> LockWord {
        LockWord::from_bits_truncate(self.word.load(Ordering::Acquire) & FLAG_MASK)
    }

    /// Publication complete?
    fn satisfied(&self) -> bool {
        self.flags().contains(LockWord::READY)
    }

    /// Published and not yet consumed?
    fn retrievable(&self) -> bool {
        self.flags().contains(LockWord::WRITE | LockWord::READY)
    }

    fn acquire_spin(&self) {
        let mut spinner = SpinWait::new();
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if word & LockWord::SPIN.bits() != 0 {
                spinner.spin_once();
                continue;
            }
            if self
                .word
                .compare_exchange_weak(
                    word,
                    word | LockWord::SPIN.bits(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    fn release_spin(&self) {
        self.word.fetch_and(!LockWord::SPIN.bits(), Ordering::Release);
    }

    fn sync_pair(&self) -> Option<&SyncPair> {
        let addr = self.word.load(Ordering::Acquire) & !FLAG_MASK;
        if addr == 0 {
            return None;
        }
        // Safety: a non-zero pointer field is the SyncPair installed by
        // `install_sync_pair`, freed only in Drop
        Some(unsafe { &*ptr::with_exposed_provenance::<SyncPair>(addr) })
    }

    /// Installs the mutex/condvar pair on first blocking use. Double-checked
    /// under the spin bit so racing waiters agree on one allocation.
    fn install_sync_pair(&self) -> &SyncPair {
        if let Some(pair) = self.sync_pair() {
            return pair;
        }
        self.acquire_spin();
        if self.sync_pair().is_none() {
            let pair = Box::new(SyncPair {
                mutex: Mutex::new(()),
                cv: Condvar::new(),
            });
            let addr = Box::into_raw(pair).expose_provenance();
            debug_assert_eq!(addr & FLAG_MASK, 0, "SyncPair must be 8-aligned");
            self.word.fetch_or(addr, Ordering::AcqRel);
        }
        self.release_spin();
        self.sync_pair().expect("sync pair just installed")
    }

    fn notify_if_waiting(&self) {
        if let Some(pair) = self.sync_pair() {
            // taking the mutex orders the notify after any in-flight
            // check-then-wait
            let _guard = pair.mutex.lock().unwrap();
            pair.cv.notify_all();
        }
    }

    /// Claims the write bit. `false` means the state is (or is about to be)
    /// satisfied by somebody else.
    fn try_claim_write(&self) -> bool {
        let mut spinner = SpinWait::new();
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word & LockWord::WRITE.bits() != 0 {
                if word & LockWord::READY.bits() != 0 {
                    return false;
                }
                // a writer is mid-publish; once it completes the claim fails
                spinner.spin_once();
                continue;
            }
            if self
                .word
                .compare_exchange(
                    word,
                    word | LockWord::WRITE.bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Stores `outcome` and completes publication. The write claim must be
    /// held (checked path) or known unique (unchecked path).
    fn publish(&self, outcome: Outcome<T>, claim_held: bool) {
        self.outcome.with_mut(|slot| {
            // Safety: the write claim makes the producer the only accessor
            // until READY is visible
            unsafe {
                *slot = Some(outcome);
            }
        });

        let bits = if claim_held {
            LockWord::READY.bits()
        } else {
            (LockWord::READY | LockWord::WRITE).bits()
        };
        self.word.fetch_or(bits, Ordering::AcqRel);
        self.notify_if_waiting();
        self.dispatch_continuation();
    }

    fn set_value(&self, value: T) -> Result<(), FutureError> {
        if !self.try_claim_write() {
            return Err(FutureError::new(FutureErrorKind::PromiseAlreadySatisfied));
        }
        self.publish(Outcome::Value(value), true);
        Ok(())
    }

    fn set_value_unchecked(&self, value: T) {
        self.publish(Outcome::Value(value), false);
    }

    fn set_panic(&self, payload: Box<dyn Any + Send>) -> Result<(), FutureError> {
        if !self.try_claim_write() {
            return Err(FutureError::new(FutureErrorKind::PromiseAlreadySatisfied));
        }
        self.publish(Outcome::Panicked(payload), true);
        Ok(())
    }

    fn set_panic_unchecked(&self, payload: Box<dyn Any + Send>) {
        self.publish(Outcome::Panicked(payload), false);
    }

    fn set_error_unchecked(&self, kind: FutureErrorKind) {
        self.publish(Outcome::Error(kind), false);
    }

    fn wait(&self) {
        if self.satisfied() {
            return;
        }
        let pair = self.install_sync_pair();
        let mut guard = pair.mutex.lock().unwrap();
        while !self.satisfied() {
            guard = pair.cv.wait(guard).unwrap();
        }
    }

    /// Steady-clock timed wait; `true` when the state is satisfied.
    #[cfg(not(loom))]
    fn wait_until(&self, deadline: std::time::Instant) -> bool {
        if self.satisfied() {
            return true;
        }
        let pair = self.install_sync_pair();
        let mut guard = pair.mutex.lock().unwrap();
        while !self.satisfied() {
            let now = std::time::Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return self.satisfied();
            };
            let (g, _timed_out) = pair.cv.wait_timeout(guard, remaining).unwrap();
            guard = g;
        }
        true
    }

    #[cfg(loom)]
    fn wait_until(&self, _deadline: std::time::Instant) -> bool {
        self.wait();
        true
    }

    /// Marks the value consumed. Exactly one caller wins; the rest see
    /// `FutureAlreadyRetrieved`.
    fn consume(&self) -> Result<(), FutureError> {
        self.acquire_spin();
        if !self.retrievable() {
            self.release_spin();
            return Err(FutureError::new(FutureErrorKind::FutureAlreadyRetrieved));
        }
        self.word.fetch_and(!LockWord::WRITE.bits(), Ordering::AcqRel);
        self.release_spin();
        Ok(())
    }

    fn get(&self) -> Result<T, FutureError> {
        self.wait();
        self.consume()?;
        let outcome = self.outcome.with_mut(|slot| {
            // Safety: winning `consume` makes this the only accessor of the
            // published outcome
            unsafe { (*slot).take() }
        });
        match outcome {
            Some(Outcome::Value(value)) => Ok(value),
            Some(Outcome::Error(kind)) => Err(FutureError::new(kind)),
            Some(Outcome::Panicked(payload)) => std::panic::resume_unwind(payload),
            None => unreachable!("consume() won on an unpublished state"),
        }
    }

    /// Installs `continuation`; when the state was satisfied first, it is
    /// taken back out and dispatched with the already-fulfilled policy.
    ///
    /// # Panics
    ///
    /// Panics when a continuation is already installed.
    fn install_continuation(&self, continuation: Box<Continuation>) {
        let ptr = Box::into_raw(continuation);
        let prev = self.continuation.swap(ptr, Ordering::AcqRel);

        if prev == Self::satisfied_sentinel() {
            let mine = self.continuation.swap(Self::satisfied_sentinel(), Ordering::AcqRel);
            if mine == ptr {
                // Safety: we took back the pointer we just leaked in
                let continuation = unsafe { Box::from_raw(mine) };
                continuation.on_already_fulfilled();
            } else if !mine.is_null() && mine != Self::satisfied_sentinel() {
                // Safety: reclaim the displaced install before failing
                drop(unsafe { Box::from_raw(mine) });
                panic!("at most one continuation may be installed on a future");
            }
        } else if !prev.is_null() {
            // Safety: the swap handed us the previously installed Box
            drop(unsafe { Box::from_raw(prev) });
            panic!("at most one continuation may be installed on a future");
        }
    }

    /// Completion-side half of the continuation handshake.
    fn dispatch_continuation(&self) {
        let prev = self.continuation.swap(Self::satisfied_sentinel(), Ordering::AcqRel);
        if !prev.is_null() && prev != Self::satisfied_sentinel() {
            // Safety: the swap handed us the installed Box
            let continuation = unsafe { Box::from_raw(prev) };
            continuation.on_completion();
        }
    }

    fn continuation_installed(&self) -> bool {
        let ptr = self.continuation.load(Ordering::Acquire);
        !ptr.is_null() && ptr != Self::satisfied_sentinel()
    }
}

impl<T> Drop for SharedState<T> {
    fn drop(&mut self) {
        let word = self.word.load(Ordering::Acquire);
        let addr = word & !FLAG_MASK;
        if addr != 0 {
            // Safety: the tagged pointer was created by install_sync_pair
            // and nobody can borrow it past the last reference
            drop(unsafe { Box::from_raw(ptr::with_exposed_provenance_mut::<SyncPair>(addr)) });
        }
        let cont = *self.continuation.get_mut();
        if !cont.is_null() && cont != Self::satisfied_sentinel() {
            // Safety: an installed-but-never-dispatched continuation is
            // exclusively ours now
            drop(unsafe { Box::from_raw(cont) });
        }
    }
}

// === impl Promise ===

impl<T: Send + 'static> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState::new()),
        }
    }

    /// A future observing this promise. May be called more than once; the
    /// published value is still retrievable exactly once overall.
    #[must_use]
    pub fn get_future(&self) -> Future<T> {
        Future {
            state: Some(self.state.clone()),
        }
    }

    /// Publishes `value`.
    ///
    /// # Errors
    ///
    /// [`FutureErrorKind::PromiseAlreadySatisfied`] when something was
    /// published before.
    pub fn set_value(&self, value: T) -> Result<(), FutureError> {
        self.state.set_value(value)
    }

    /// Publishes `value` without the already-satisfied claim check. Only
    /// sound for a producer known to publish exactly once.
    pub fn set_value_unchecked(&self, value: T) {
        self.state.set_value_unchecked(value);
    }

    /// Publishes a failure; [`Future::get`] re-raises `payload` at the
    /// retrieving caller.
    ///
    /// # Errors
    ///
    /// [`FutureErrorKind::PromiseAlreadySatisfied`] when something was
    /// published before.
    pub fn set_panic(&self, payload: Box<dyn Any + Send>) -> Result<(), FutureError> {
        self.state.set_panic(payload)
    }

    /// Unchecked variant of [`set_panic`][Self::set_panic].
    pub fn set_panic_unchecked(&self, payload: Box<dyn Any + Send>) {
        self.state.set_panic_unchecked(payload);
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.state.satisfied() {
            tracing::debug!("promise dropped unsatisfied; finalizing as broken");
            self.state.set_error_unchecked(FutureErrorKind::BrokenPromise);
        }
    }
}

impl<T> core::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Promise")
            .field("satisfied", &self.state.satisfied())
            .finish_non_exhaustive()
    }
}

// === impl Future ===

impl<T: Send + 'static> Future<T> {
    /// `true` when this handle is associated with shared state.
    #[must_use]
    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// `true` once a value or failure has been published.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.satisfied())
    }

    /// `true` while the published value is still retrievable here: state
    /// present, not yet consumed, no continuation claiming it.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| !state.continuation_installed() && (!state.satisfied() || state.retrievable()))
    }

    /// Blocks until a value or failure is published. Returns immediately on
    /// a stateless handle.
    pub fn wait(&self) {
        if let Some(state) = &self.state {
            state.wait();
        }
    }

    /// Blocks until publication or `deadline` (steady clock). `true` when
    /// the state is satisfied. A stateless handle is never satisfied.
    pub fn wait_until(&self, deadline: std::time::Instant) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.wait_until(deadline))
    }

    /// Blocks for at most `timeout` (steady clock). `true` when the state
    /// is satisfied.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(std::time::Instant::now() + timeout)
    }

    /// Blocks until publication, then retrieves the value.
    ///
    /// A producer-captured panic is re-raised here.
    ///
    /// # Errors
    ///
    /// - [`FutureErrorKind::NoState`] on a stateless handle;
    /// - [`FutureErrorKind::BrokenPromise`] when the promise was dropped
    ///   unpublished;
    /// - [`FutureErrorKind::FutureAlreadyRetrieved`] when the value was
    ///   already consumed (here or through another handle).
    pub fn get(&self) -> Result<T, FutureError> {
        match &self.state {
            None => Err(FutureError::new(FutureErrorKind::NoState)),
            Some(state) => state.get(),
        }
    }

    /// Attaches `f` as the continuation and returns a future of its result.
    ///
    /// `f` receives a future of this state (retrieve with
    /// [`get`][Self::get]); its return value (or panic) is forwarded into
    /// the returned future. `context` overrides the executor captured for
    /// the async dispatch flavors.
    ///
    /// # Panics
    ///
    /// Panics when a continuation is already installed on this state.
    pub fn then<R, F>(
        mut self,
        f: F,
        flag: ContinuationFlag,
        context: Option<ExecutorHandle>,
    ) -> Future<R>
    where
        F: FnOnce(Future<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let Some(state) = self.state.take() else {
            let chained = Promise::<R>::new();
            chained.state.set_error_unchecked(FutureErrorKind::NoState);
            return chained.get_future();
        };

        let chained = Promise::<R>::new();
        let out = chained.get_future();
        let inner = Future {
            state: Some(state.clone()),
        };
        let run = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(|| f(inner))) {
                Ok(value) => chained.set_value_unchecked(value),
                Err(payload) => chained.set_panic_unchecked(payload),
            }
        });
        state.install_continuation(Box::new(Continuation::new(flag, context, run)));
        out
    }

    /// Attaches `f` as a fire-and-forget continuation.
    ///
    /// # Panics
    ///
    /// Panics when a continuation is already installed on this state.
    pub fn continue_with<F>(mut self, f: F, flag: ContinuationFlag, context: Option<ExecutorHandle>)
    where
        F: FnOnce(Future<T>) + Send + 'static,
    {
        let Some(state) = self.state.take() else {
            tracing::warn!("continue_with on a stateless future; dropping the continuation");
            return;
        };

        let inner = Future {
            state: Some(state.clone()),
        };
        let run = Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(inner))) {
                tracing::error!(
                    panic = %crate::error::panic_message(&*payload),
                    "continuation panicked; continuations must not panic",
                );
            }
        });
        state.install_continuation(Box::new(Continuation::new(flag, context, run)));
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self { state: None }
    }
}

impl<T> core::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Future")
            .field("has_state", &self.state.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ManualDrainExecutor;
    use crate::loom::sync::atomic::AtomicUsize;
    use crate::loom::thread;
    use std::time::Instant;

    #[test]
    fn set_then_get() {
        let promise = Promise::new();
        let future = promise.get_future();

        promise.set_value(42_u32).unwrap();
        assert!(future.is_ready());
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn unit_promise() {
        let promise = Promise::<()>::new();
        let future = promise.get_future();
        promise.set_value(()).unwrap();
        future.get().unwrap();
    }

    #[test]
    fn second_set_reports_already_satisfied() {
        let promise = Promise::new();
        let future = promise.get_future();

        promise.set_value(1_u32).unwrap();
        let err = promise.set_value(2).unwrap_err();
        assert_eq!(err.kind(), FutureErrorKind::PromiseAlreadySatisfied);

        // the first publication is the one observed
        assert_eq!(future.get().unwrap(), 1);
    }

    #[test]
    fn second_get_reports_already_retrieved() {
        let promise = Promise::new();
        let future = promise.get_future();

        promise.set_value(5_u32).unwrap();
        assert_eq!(future.get().unwrap(), 5);
        let err = future.get().unwrap_err();
        assert_eq!(err.kind(), FutureErrorKind::FutureAlreadyRetrieved);
    }

    #[test]
    fn dropping_the_promise_breaks_it() {
        let promise = Promise::<u32>::new();
        let future = promise.get_future();
        drop(promise);

        assert!(future.is_ready());
        let err = future.get().unwrap_err();
        assert_eq!(err.kind(), FutureErrorKind::BrokenPromise);
    }

    #[test]
    fn stateless_future_reports_no_state() {
        let future = Future::<u32>::default();
        assert!(!future.has_state());
        let err = future.get().unwrap_err();
        assert_eq!(err.kind(), FutureErrorKind::NoState);
    }

    #[test]
    fn blocking_wait_across_threads() {
        crate::loom::model(|| {
            let promise = Promise::new();
            let future = promise.get_future();

            let producer = thread::spawn(move || {
                #[cfg(not(loom))]
                std::thread::sleep(Duration::from_millis(20));
                promise.set_value(7_u32).unwrap();
            });

            future.wait();
            assert_eq!(future.get().unwrap(), 7);
            producer.join().unwrap();
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn timed_wait_reports_timeout() {
        let promise = Promise::<u32>::new();
        let future = promise.get_future();

        assert!(!future.wait_for(Duration::from_millis(10)));
        promise.set_value(3).unwrap();
        assert!(future.wait_for(Duration::from_millis(10)));
        assert!(future.wait_until(Instant::now()));
    }

    #[test]
    fn panic_is_reraised_at_get() {
        let promise = Promise::<u32>::new();
        let future = promise.get_future();
        promise.set_panic(Box::new("producer died")).unwrap();

        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| future.get()));
        let payload = caught.expect_err("get must re-raise");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"producer died"));
    }

    #[test]
    fn continuation_installed_before_satisfaction_runs_at_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let promise = Promise::new();
        let future = promise.get_future();

        let ran2 = ran.clone();
        future.continue_with(
            move |f| {
                assert_eq!(f.get().unwrap(), 10);
                ran2.fetch_add(1, Ordering::Relaxed);
            },
            ContinuationFlag::AsyncIfDistant,
            None,
        );

        assert_eq!(ran.load(Ordering::Relaxed), 0);
        // AsyncIfDistant installed first: the producer invokes it right
        // here, at the completion site
        promise.set_value(10_u32).unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn continuation_installed_after_satisfaction_goes_async() {
        let exec = ManualDrainExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let promise = Promise::new();
        let future = promise.get_future();

        promise.set_value(11_u32).unwrap();

        let ran2 = ran.clone();
        future.continue_with(
            move |f| {
                assert_eq!(f.get().unwrap(), 11);
                ran2.fetch_add(1, Ordering::Relaxed);
            },
            ContinuationFlag::AsyncIfDistant,
            Some(exec.handle()),
        );

        // distant completion: the installer does not pay; the context does
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        exec.drain_once();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn force_async_never_runs_inline() {
        let exec = ManualDrainExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let promise = Promise::new();
        let future = promise.get_future();

        let ran2 = ran.clone();
        future.continue_with(
            move |_| {
                ran2.fetch_add(1, Ordering::Relaxed);
            },
            ContinuationFlag::ForceAsync,
            Some(exec.handle()),
        );

        promise.set_value(1_u32).unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        exec.drain_once();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn then_chains_a_transformed_future() {
        let promise = Promise::new();
        let chained = promise
            .get_future()
            .then(|f| f.get().unwrap() * 2, ContinuationFlag::OnCompletion, None);

        promise.set_value(21_u32).unwrap();
        assert_eq!(chained.get().unwrap(), 42);
    }

    #[test]
    fn then_forwards_panics_into_the_chain() {
        let promise = Promise::<u32>::new();
        let chained = promise.get_future().then(
            |_| -> u32 { panic!("transform failed") },
            ContinuationFlag::OnCompletion,
            None,
        );

        promise.set_value(1).unwrap();
        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| chained.get()));
        assert!(caught.is_err());
    }

    #[test]
    fn then_propagates_broken_promises() {
        let promise = Promise::<u32>::new();
        let chained = promise.get_future().then(
            |f| f.get().map(|v| v + 1),
            ContinuationFlag::OnCompletion,
            None,
        );

        drop(promise);
        let inner = chained.get().unwrap();
        assert_eq!(inner.unwrap_err().kind(), FutureErrorKind::BrokenPromise);
    }

    #[test]
    #[should_panic = "at most one continuation"]
    fn second_continuation_is_fatal() {
        let promise = Promise::<u32>::new();
        let f1 = promise.get_future();
        let f2 = promise.get_future();

        f1.continue_with(|_| {}, ContinuationFlag::OnCompletion, None);
        f2.continue_with(|_| {}, ContinuationFlag::OnCompletion, None);
    }
}
