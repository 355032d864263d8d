// Reactor-style networking library with composable futures and promises
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2023 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2023 Cyphernet DAO, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Composable future/promise core.
//!
//! A [`Promise`] is the producer handle and a [`Future`] the move-only
//! consumer handle over a single shared state carrying one value or one
//! failure. Continuations chain with [`Future::then`] (plain values),
//! [`Future::and_then`] (future-returning, auto-unwrapped one level) and
//! [`Future::then_result`] (failure-consuming), each with a variant posting
//! the continuation to a [`Scheduler`] — event loops and the thread pool
//! both qualify. Combinators over iterators of futures live in [`combine`].

mod combine;

pub use combine::{when_all, when_any, when_any_if, when_n, when_n_if};

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A unit of deferred work accepted by a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send>;

/// Any target that accepts a zero-argument work item for later execution.
///
/// Event loop handles and thread-pool handles are both schedulers; supplying
/// one to a continuation posts the continuation instead of running it inline.
pub trait Scheduler {
    fn schedule(&self, task: Task);
}

/// The captured failure of a future chain.
///
/// Cloneable so combinator outputs can replicate it per observer.
#[derive(Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Failure {
    /// future timed out
    Timeout,

    /// promise was dropped before producing a value
    BrokenPromise,

    /// no completion satisfied the predicate
    NoMatch,

    /// work submitted to a thread pool that is shut down
    Rejected,

    /// task panicked: {0}
    Panic(String),

    /// I/O error: {0}
    Io(Arc<io::Error>),
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self { Failure::Io(Arc::new(err)) }
}

/// A completed future's payload: the value, or the first captured failure.
pub type Outcome<T> = Result<T, Failure>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Progress {
    None,
    Timeout,
    Done,
    Retrieved,
}

struct Inner<T> {
    progress: Progress,
    value: Option<Outcome<T>>,
    next: Option<Box<dyn FnOnce(Outcome<T>) + Send>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    retrieved: AtomicBool,
    producers: AtomicUsize,
}

impl<T> Shared<T> {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            inner: Mutex::new(Inner {
                progress: Progress::None,
                value: None,
                next: None,
            }),
            retrieved: AtomicBool::new(false),
            producers: AtomicUsize::new(1),
        })
    }

    /// First writer wins; later writers become no-ops. The continuation, if
    /// installed, is invoked after the lock is released.
    fn complete(&self, outcome: Outcome<T>) -> bool {
        let mut inner = self.inner.lock().expect("future state mutex poisoned");
        if inner.progress != Progress::None {
            return false;
        }
        inner.progress = Progress::Done;
        match inner.next.take() {
            Some(next) => {
                drop(inner);
                next(outcome);
            }
            None => inner.value = Some(outcome),
        }
        true
    }
}

/// Producer half of a future/promise pair.
pub struct Promise<T> {
    state: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.state.producers.fetch_add(1, Ordering::AcqRel);
        Promise { state: self.state.clone() }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.state.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.complete(Err(Failure::BrokenPromise));
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self { Promise::new() }
}

impl<T> Promise<T> {
    pub fn new() -> Self { Promise { state: Shared::new() } }

    /// Fulfills the promise. Returns whether this call was the first writer.
    pub fn set_value(&self, value: T) -> bool { self.state.complete(Ok(value)) }

    /// Fails the promise. Returns whether this call was the first writer.
    pub fn set_failure(&self, failure: Failure) -> bool { self.state.complete(Err(failure)) }

    pub fn is_ready(&self) -> bool {
        self.state.inner.lock().expect("future state mutex poisoned").progress != Progress::None
    }

    /// Returns the future for this promise. A promise yields at most one
    /// future; a second call is a programmer error and panics.
    pub fn future(&self) -> Future<T> {
        if self.state.retrieved.swap(true, Ordering::AcqRel) {
            panic!("future was already retrieved from this promise");
        }
        Future { state: self.state.clone() }
    }
}

/// Consumer half of a future/promise pair; move-only.
#[must_use = "a future does nothing unless chained or waited on"]
pub struct Future<T> {
    state: Arc<Shared<T>>,
}

impl<T: Send + 'static> Future<T> {
    pub fn is_ready(&self) -> bool {
        self.state.inner.lock().expect("future state mutex poisoned").progress != Progress::None
    }

    /// Installs the raw completion continuation.
    ///
    /// If the state is already settled the continuation runs inline;
    /// otherwise the setter invokes it after releasing the state mutex.
    /// Exactly one invocation happens either way.
    pub(crate) fn on_complete(self, f: impl FnOnce(Outcome<T>) + Send + 'static) {
        let mut inner = self.state.inner.lock().expect("future state mutex poisoned");
        match inner.progress {
            Progress::Done => {
                let value = inner.value.take().expect("done future holds a value");
                inner.progress = Progress::Retrieved;
                drop(inner);
                f(value);
            }
            Progress::Timeout => {
                drop(inner);
                f(Err(Failure::Timeout));
            }
            Progress::None | Progress::Retrieved => {
                debug_assert!(inner.next.is_none(), "a future takes a single continuation");
                inner.next = Some(Box::new(f));
            }
        }
    }

    /// Chains a continuation over the success value; a failure short-circuits
    /// past `f` unchanged. Runs where the antecedent completes (inline when
    /// the antecedent is already done).
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => {
                promise.set_value(f(value));
            }
            Err(failure) => {
                promise.set_failure(failure);
            }
        });
        next
    }

    /// Like [`Future::then`], but `f` is posted to `scheduler` rather than
    /// invoked inline.
    pub fn then_on<S, U, F>(self, scheduler: S, f: F) -> Future<U>
    where
        S: Scheduler + Send + 'static,
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| {
            scheduler.schedule(Box::new(move || match outcome {
                Ok(value) => {
                    promise.set_value(f(value));
                }
                Err(failure) => {
                    promise.set_failure(failure);
                }
            }));
        });
        next
    }

    /// Chains a future-returning continuation, collapsing one level of
    /// nesting: the returned future completes with the inner future's
    /// outcome, and the inner completion is not re-scheduled.
    pub fn and_then<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => f(value).forward(promise),
            Err(failure) => {
                promise.set_failure(failure);
            }
        });
        next
    }

    /// Like [`Future::and_then`] with `f` posted to `scheduler`; the inner
    /// future still completes wherever its own setter runs.
    pub fn and_then_on<S, U, F>(self, scheduler: S, f: F) -> Future<U>
    where
        S: Scheduler + Send + 'static,
        U: Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| {
            scheduler.schedule(Box::new(move || match outcome {
                Ok(value) => f(value).forward(promise),
                Err(failure) => {
                    promise.set_failure(failure);
                }
            }));
        });
        next
    }

    /// Chains a failure-consuming continuation: `f` sees the full
    /// [`Outcome`] and may recover from a failure by returning a value.
    pub fn then_result<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| {
            promise.set_value(f(outcome));
        });
        next
    }

    /// Like [`Future::then_result`], posted to `scheduler`.
    pub fn then_result_on<S, U, F>(self, scheduler: S, f: F) -> Future<U>
    where
        S: Scheduler + Send + 'static,
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| {
            scheduler.schedule(Box::new(move || {
                promise.set_value(f(outcome));
            }));
        });
        next
    }

    /// Completes `promise` with this future's outcome.
    pub(crate) fn forward(self, promise: Promise<T>) {
        self.on_complete(move |outcome| {
            match outcome {
                Ok(value) => promise.set_value(value),
                Err(failure) => promise.set_failure(failure),
            };
        });
    }

    /// Blocks the calling thread until completion or `timeout`, returning a
    /// [`Failure::Timeout`] on expiry.
    ///
    /// Must not be called on the thread that will satisfy the promise; the
    /// deadlock is the caller's to avoid. Event-loop callbacks never block,
    /// so this belongs on plain threads only.
    pub fn wait(self, timeout: Duration) -> Outcome<T> {
        {
            let mut inner = self.state.inner.lock().expect("future state mutex poisoned");
            match inner.progress {
                Progress::Done => {
                    inner.progress = Progress::Retrieved;
                    return inner.value.take().expect("done future holds a value");
                }
                Progress::Timeout => return Err(Failure::Timeout),
                Progress::None | Progress::Retrieved => {}
            }
        }

        let gate = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = gate.clone();
        self.on_complete(move |outcome| {
            let (slot, cond) = &*signal;
            *slot.lock().expect("wait gate mutex poisoned") = Some(outcome);
            cond.notify_one();
        });

        let deadline = Instant::now() + timeout;
        let (slot, cond) = &*gate;
        let mut guard = slot.lock().expect("wait gate mutex poisoned");
        loop {
            if let Some(outcome) = guard.take() {
                return outcome;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Failure::Timeout);
            }
            guard = cond.wait_timeout(guard, left).expect("wait gate mutex poisoned").0;
        }
    }

    /// Blocks until completion with no deadline.
    pub fn get(self) -> Outcome<T> {
        {
            let mut inner = self.state.inner.lock().expect("future state mutex poisoned");
            match inner.progress {
                Progress::Done => {
                    inner.progress = Progress::Retrieved;
                    return inner.value.take().expect("done future holds a value");
                }
                Progress::Timeout => return Err(Failure::Timeout),
                Progress::None | Progress::Retrieved => {}
            }
        }

        let gate = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = gate.clone();
        self.on_complete(move |outcome| {
            let (slot, cond) = &*signal;
            *slot.lock().expect("wait gate mutex poisoned") = Some(outcome);
            cond.notify_one();
        });

        let (slot, cond) = &*gate;
        let mut guard = slot.lock().expect("wait gate mutex poisoned");
        loop {
            if let Some(outcome) = guard.take() {
                return outcome;
            }
            guard = cond.wait(guard).expect("wait gate mutex poisoned");
        }
    }

    /// Arms a timeout on this future: a timer on `lp` flips the progress to
    /// `Timeout` if the value has not arrived within `after`, preempting any
    /// later `set_value`, and runs `hook` exactly once. A continuation
    /// installed on this future observes the expiry as a
    /// [`Failure::Timeout`].
    ///
    /// The timeout binds to *this* future, not the root of a chain: with
    /// `f.then(x).then(y).on_timeout(..)` the hook may fire after some chain
    /// links already ran. Avoid combining long chains with timeouts.
    pub fn on_timeout(
        self,
        after: Duration,
        hook: impl FnOnce() + Send + 'static,
        lp: &crate::LoopHandle,
    ) -> Future<T> {
        let state = self.state.clone();
        lp.schedule_later(after, move || {
            // the same drain-then-invoke protocol as `complete`, so an
            // installed continuation still fires exactly once
            let next = {
                let mut inner = state.inner.lock().expect("future state mutex poisoned");
                if inner.progress != Progress::None {
                    return;
                }
                inner.progress = Progress::Timeout;
                inner.next.take()
            };
            if let Some(next) = next {
                next(Err(Failure::Timeout));
            }
            hook();
        });
        self
    }
}

impl<U: Send + 'static> Future<Future<U>> {
    /// Collapses `Future<Future<U>>` into `Future<U>`, preserving failures.
    pub fn unwrap(self) -> Future<U> {
        let promise = Promise::new();
        let next = promise.future();
        self.on_complete(move |outcome| match outcome {
            Ok(inner) => inner.forward(promise),
            Err(failure) => {
                promise.set_failure(failure);
            }
        });
        next
    }
}

/// A future already completed with `value`.
pub fn make_ready_future<T: Send + 'static>(value: T) -> Future<T> {
    let promise = Promise::new();
    let future = promise.future();
    promise.set_value(value);
    future
}

/// A future already failed with `failure`.
pub fn make_failed_future<T: Send + 'static>(failure: Failure) -> Future<T> {
    let promise = Promise::new();
    let future = promise.future();
    promise.set_failure(failure);
    future
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn promise_value_flows_to_future() {
        let promise = Promise::new();
        let future = promise.future();
        assert!(!promise.is_ready());
        assert!(promise.set_value(42));
        assert!(promise.is_ready());
        assert_eq!(future.get().expect("fulfilled"), 42);
    }

    #[test]
    fn first_writer_wins() {
        let promise = Promise::new();
        let future = promise.future();
        assert!(promise.set_value(1));
        assert!(!promise.set_value(2));
        assert!(!promise.set_failure(Failure::Timeout));
        assert_eq!(future.get().expect("first value"), 1);
    }

    #[test]
    #[should_panic(expected = "already retrieved")]
    fn second_future_retrieval_panics() {
        let promise = Promise::<u32>::new();
        let _first = promise.future();
        let _second = promise.future();
    }

    #[test]
    fn ready_then_runs_inline() {
        let result = make_ready_future(6).then(|x| x * 7).get();
        assert_eq!(result.expect("chained"), 42);
    }

    #[test]
    fn failure_short_circuits_then() {
        let touched = Arc::new(AtomicBool::new(false));
        let witness = touched.clone();
        let result = make_failed_future::<u32>(Failure::NoMatch)
            .then(move |x| {
                witness.store(true, Ordering::SeqCst);
                x + 1
            })
            .get();
        assert!(matches!(result, Err(Failure::NoMatch)));
        assert!(!touched.load(Ordering::SeqCst));
    }

    #[test]
    fn then_result_recovers_from_failure() {
        let result = make_failed_future::<u32>(Failure::Timeout)
            .then_result(|outcome| match outcome {
                Ok(v) => v,
                Err(_) => 7,
            })
            .get();
        assert_eq!(result.expect("recovered"), 7);
    }

    #[test]
    fn and_then_unwraps_one_level() {
        let result = make_ready_future(3).and_then(|x| make_ready_future(x + 4)).get();
        assert_eq!(result.expect("unwrapped"), 7);

        let nested = make_ready_future(make_ready_future(9u32));
        assert_eq!(nested.unwrap().get().expect("unwrapped"), 9);
    }

    #[test]
    fn continuation_installed_before_set_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let promise = Promise::new();
        let future = promise.future();

        let count = fired.clone();
        let chained = future.then(move |x: u32| {
            count.fetch_add(1, Ordering::SeqCst);
            x
        });

        let setter = thread::spawn(move || promise.set_value(11));
        assert_eq!(chained.get().expect("set from other thread"), 11);
        setter.join().expect("setter thread");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_times_out_with_failure() {
        let promise = Promise::<u32>::new();
        let future = promise.future();
        let outcome = future.wait(Duration::from_millis(20));
        assert!(matches!(outcome, Err(Failure::Timeout)));
        // keep the promise alive past the wait
        drop(promise);
    }

    #[test]
    fn dropped_promise_breaks_the_chain() {
        let promise = Promise::<u32>::new();
        let future = promise.future();
        drop(promise);
        assert!(matches!(future.get(), Err(Failure::BrokenPromise)));
    }
}
