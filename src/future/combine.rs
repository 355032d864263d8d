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

//! Combinators over sets of futures: all, any, first-N, and the
//! predicate-filtered variants.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{make_ready_future, Failure, Future, Outcome, Promise};

/// Completes when every input completes, yielding per-input outcomes in
/// input order. Empty input completes synchronously with an empty vector.
pub fn when_all<T, I>(futures: I) -> Future<Vec<Outcome<T>>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return make_ready_future(Vec::new());
    }

    struct AllContext<T> {
        results: Mutex<Vec<Option<Outcome<T>>>>,
        collected: AtomicUsize,
        promise: Promise<Vec<Outcome<T>>>,
    }

    let total = futures.len();
    let ctx = Arc::new(AllContext {
        results: Mutex::new((0..total).map(|_| None).collect()),
        collected: AtomicUsize::new(0),
        promise: Promise::new(),
    });
    let output = ctx.promise.future();

    for (i, future) in futures.into_iter().enumerate() {
        let ctx = ctx.clone();
        future.on_complete(move |outcome| {
            ctx.results.lock().expect("when_all results poisoned")[i] = Some(outcome);
            if ctx.collected.fetch_add(1, Ordering::AcqRel) + 1 == total {
                let slots = mem::take(&mut *ctx.results.lock().expect("when_all results poisoned"));
                let results = slots
                    .into_iter()
                    .map(|slot| slot.expect("every input has completed"))
                    .collect();
                ctx.promise.set_value(results);
            }
        });
    }
    output
}

/// Completes with `(index, outcome)` of the first input to complete; later
/// completions are dropped. Empty input fails with [`Failure::NoMatch`].
pub fn when_any<T, I>(futures: I) -> Future<(usize, Outcome<T>)>
where
    T: Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return super::make_failed_future(Failure::NoMatch);
    }

    struct AnyContext<T> {
        done: AtomicBool,
        promise: Promise<(usize, Outcome<T>)>,
    }

    let ctx = Arc::new(AnyContext {
        done: AtomicBool::new(false),
        promise: Promise::new(),
    });
    let output = ctx.promise.future();

    for (i, future) in futures.into_iter().enumerate() {
        let ctx = ctx.clone();
        future.on_complete(move |outcome| {
            if !ctx.done.swap(true, Ordering::AcqRel) {
                ctx.promise.set_value((i, outcome));
            }
        });
    }
    output
}

/// Completes once `n` inputs have completed, yielding their
/// `(index, outcome)` pairs in completion order. `n` is clamped to the input
/// count; `n == 0` completes synchronously empty.
pub fn when_n<T, I>(n: usize, futures: I) -> Future<Vec<(usize, Outcome<T>)>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    let needed = n.min(futures.len());
    if needed == 0 {
        return make_ready_future(Vec::new());
    }

    struct NState<T> {
        results: Vec<(usize, Outcome<T>)>,
        done: bool,
    }
    struct NContext<T> {
        state: Mutex<NState<T>>,
        needed: usize,
        promise: Promise<Vec<(usize, Outcome<T>)>>,
    }

    let ctx = Arc::new(NContext {
        state: Mutex::new(NState { results: Vec::new(), done: false }),
        needed,
        promise: Promise::new(),
    });
    let output = ctx.promise.future();

    for (i, future) in futures.into_iter().enumerate() {
        let ctx = ctx.clone();
        future.on_complete(move |outcome| {
            let mut state = ctx.state.lock().expect("when_n state poisoned");
            if state.done {
                return;
            }
            state.results.push((i, outcome));
            if state.results.len() == ctx.needed {
                state.done = true;
                let results = mem::take(&mut state.results);
                drop(state);
                ctx.promise.set_value(results);
            }
        });
    }
    output
}

/// Like [`when_any`], but only completions satisfying `pred` count. When all
/// inputs settle without a match, fails with [`Failure::NoMatch`].
pub fn when_any_if<T, I, P>(futures: I, pred: P) -> Future<(usize, Outcome<T>)>
where
    T: Send + 'static,
    I: IntoIterator<Item = Future<T>>,
    P: Fn(&Outcome<T>) -> bool + Send + Sync + 'static,
{
    let futures: Vec<_> = futures.into_iter().collect();
    if futures.is_empty() {
        return super::make_failed_future(Failure::NoMatch);
    }

    struct IfAnyContext<T> {
        done: AtomicBool,
        returned: AtomicUsize,
        promise: Promise<(usize, Outcome<T>)>,
    }

    let total = futures.len();
    let pred = Arc::new(pred);
    let ctx = Arc::new(IfAnyContext {
        done: AtomicBool::new(false),
        returned: AtomicUsize::new(0),
        promise: Promise::new(),
    });
    let output = ctx.promise.future();

    for (i, future) in futures.into_iter().enumerate() {
        let ctx = ctx.clone();
        let pred = pred.clone();
        future.on_complete(move |outcome| {
            if ctx.done.load(Ordering::Acquire) {
                ctx.returned.fetch_add(1, Ordering::AcqRel);
                return;
            }
            if !pred(&outcome) {
                let returned = ctx.returned.fetch_add(1, Ordering::AcqRel) + 1;
                if returned == total && !ctx.done.swap(true, Ordering::AcqRel) {
                    ctx.promise.set_failure(Failure::NoMatch);
                }
                return;
            }
            if !ctx.done.swap(true, Ordering::AcqRel) {
                ctx.promise.set_value((i, outcome));
            }
            ctx.returned.fetch_add(1, Ordering::AcqRel);
        });
    }
    output
}

/// Like [`when_n`] restricted to completions satisfying `pred`. When the
/// inputs are exhausted before `n` matches, fails with [`Failure::NoMatch`];
/// no partial result is delivered.
pub fn when_n_if<T, I, P>(n: usize, futures: I, pred: P) -> Future<Vec<(usize, Outcome<T>)>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Future<T>>,
    P: Fn(&Outcome<T>) -> bool + Send + Sync + 'static,
{
    let futures: Vec<_> = futures.into_iter().collect();
    let total = futures.len();
    let needed = n.min(total);
    if needed == 0 {
        return make_ready_future(Vec::new());
    }

    struct IfNState<T> {
        results: Vec<(usize, Outcome<T>)>,
        returned: usize,
        done: bool,
    }
    struct IfNContext<T> {
        state: Mutex<IfNState<T>>,
        needed: usize,
        promise: Promise<Vec<(usize, Outcome<T>)>>,
    }

    let pred = Arc::new(pred);
    let ctx = Arc::new(IfNContext {
        state: Mutex::new(IfNState { results: Vec::new(), returned: 0, done: false }),
        needed,
        promise: Promise::new(),
    });
    let output = ctx.promise.future();

    for (i, future) in futures.into_iter().enumerate() {
        let ctx = ctx.clone();
        let pred = pred.clone();
        future.on_complete(move |outcome| {
            let mut state = ctx.state.lock().expect("when_n_if state poisoned");
            state.returned += 1;
            if state.done {
                return;
            }
            if !pred(&outcome) {
                if state.returned == total {
                    // all settled, not enough matches
                    state.done = true;
                    drop(state);
                    ctx.promise.set_failure(Failure::NoMatch);
                }
                return;
            }
            state.results.push((i, outcome));
            if state.results.len() == ctx.needed {
                state.done = true;
                let results = mem::take(&mut state.results);
                drop(state);
                ctx.promise.set_value(results);
            }
        });
    }
    output
}

#[cfg(test)]
mod tests {
    use super::super::{make_failed_future, make_ready_future};
    use super::*;

    #[test]
    fn when_all_of_ready_inputs_completes_synchronously() {
        let futures = (0..4u32).map(make_ready_future);
        let results = when_all(futures).get().expect("all complete");
        assert_eq!(results.len(), 4);
        for (i, outcome) in results.into_iter().enumerate() {
            assert_eq!(outcome.expect("ready input"), i as u32);
        }
    }

    #[test]
    fn when_all_keeps_per_input_failures() {
        let futures = vec![make_ready_future(1u32), make_failed_future(Failure::Timeout)];
        let results = when_all(futures).get().expect("aggregate completes");
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Failure::Timeout)));
    }

    #[test]
    fn when_any_yields_first_completion() {
        let pending = Promise::<u32>::new();
        let futures = vec![pending.future(), make_ready_future(5u32)];
        let (index, outcome) = when_any(futures).get().expect("one completed");
        assert_eq!(index, 1);
        assert_eq!(outcome.expect("ready input"), 5);
        pending.set_value(0);
    }

    #[test]
    fn when_n_collects_first_n() {
        let pending = Promise::<u32>::new();
        let futures =
            vec![make_ready_future(10u32), pending.future(), make_ready_future(30u32)];
        let results = when_n(2, futures).get().expect("two completed");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert_eq!(results[1].0, 2);
        pending.set_value(0);
    }

    #[test]
    fn when_any_if_skips_non_matching() {
        let futures = vec![make_ready_future(1u32), make_ready_future(8u32)];
        let (index, outcome) = when_any_if(futures, |out| matches!(out, Ok(v) if *v > 4))
            .get()
            .expect("matching completion");
        assert_eq!(index, 1);
        assert_eq!(outcome.expect("match"), 8);
    }

    #[test]
    fn when_n_if_fails_without_enough_matches() {
        // 5 inputs, 2 satisfy the predicate, 3 needed
        let futures: Vec<_> = (0..5u32).map(make_ready_future).collect();
        let result = when_n_if(3, futures, |out| matches!(out, Ok(v) if *v >= 3)).get();
        assert!(matches!(result, Err(Failure::NoMatch)));
    }
}
