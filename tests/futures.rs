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

//! Cross-thread future pipelines: scheduler hops between the pool and an
//! event loop, timer-armed timeouts, and predicate combinators under real
//! concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::future::{when_n_if, Failure};
use netloop::{EventLoop, LoopHandle, Promise, ThreadPool};

/// Spawns a bare event loop thread and returns its handle.
fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = chan::bounded(1);
    let thread = thread::spawn(move || {
        let lp = EventLoop::new().expect("event loop for the test thread");
        tx.send(lp.handle()).expect("test waits for the handle");
        lp.run();
    });
    (rx.recv().expect("loop boots"), thread)
}

#[test]
fn pipeline_alternates_between_pool_and_loop_threads() {
    let pool = Arc::new(ThreadPool::new());
    let (lh, loop_thread) = spawn_loop();

    let loop_tid = lh.execute(thread::current).get().expect("loop identity").id();
    let stages: Arc<Mutex<Vec<(&'static str, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));

    let record = |stages: &Arc<Mutex<Vec<(&'static str, ThreadId)>>>, name: &'static str| {
        stages.lock().expect("stage log").push((name, thread::current().id()));
    };

    let chained = pool
        .execute({
            let stages = stages.clone();
            move || {
                record(&stages, "compute");
                41
            }
        })
        .then_on(lh.clone(), {
            let stages = stages.clone();
            move |x| {
                record(&stages, "increment");
                x + 1
            }
        })
        .and_then({
            let stages = stages.clone();
            let pool = pool.clone();
            move |x| {
                pool.execute({
                    let stages = stages.clone();
                    move || {
                        record(&stages, "side-effect");
                        x
                    }
                })
            }
        })
        .then_on(lh.clone(), {
            let stages = stages.clone();
            let stopper = lh.clone();
            move |x| {
                record(&stages, "stop");
                stopper.stop();
                x
            }
        });

    assert_eq!(chained.get().expect("pipeline completes"), 42);
    loop_thread.join().expect("loop thread exits");

    let stages = stages.lock().expect("stage log");
    let names: Vec<_> = stages.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["compute", "increment", "side-effect", "stop"]);

    let tid = |name: &str| {
        stages.iter().find(|(n, _)| *n == name).map(|(_, tid)| *tid).expect("stage ran")
    };
    assert_ne!(tid("compute"), loop_tid, "compute runs on a pool worker");
    assert_eq!(tid("increment"), loop_tid, "increment hops to the loop");
    assert_ne!(tid("side-effect"), loop_tid, "side-effect hops back to the pool");
    assert_eq!(tid("stop"), loop_tid, "the final stage lands on the loop");
}

#[test]
fn timeout_hook_fires_once_and_preempts_a_late_set() {
    let (lh, loop_thread) = spawn_loop();

    let fired = Arc::new(AtomicUsize::new(0));
    let promise = Promise::<u32>::new();
    let hook_count = fired.clone();
    let future = promise.future().on_timeout(
        Duration::from_millis(50),
        move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        },
        &lh,
    );

    thread::sleep(Duration::from_millis(120));
    assert!(!promise.set_value(7), "the late value is silently ignored");
    assert_eq!(fired.load(Ordering::SeqCst), 1, "the hook ran exactly once");
    assert!(matches!(future.wait(Duration::from_millis(10)), Err(Failure::Timeout)));

    lh.stop();
    loop_thread.join().expect("loop thread exits");
}

#[test]
fn timeout_flows_through_a_continuation_installed_first() {
    let (lh, loop_thread) = spawn_loop();

    let hook_fired = Arc::new(AtomicUsize::new(0));
    let chained_ran = Arc::new(AtomicUsize::new(0));

    let promise = Promise::<u32>::new();
    let hook_count = hook_fired.clone();
    let chain_count = chained_ran.clone();
    // the continuation is installed before the timer fires: it must still be
    // invoked exactly once, with the timeout failure short-circuiting past it
    let tail = promise
        .future()
        .on_timeout(
            Duration::from_millis(30),
            move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            },
            &lh,
        )
        .then(move |x| {
            chain_count.fetch_add(1, Ordering::SeqCst);
            x
        });

    // a deadline-less get() would hang forever if the continuation leaked
    assert!(matches!(tail.wait(Duration::from_secs(5)), Err(Failure::Timeout)));
    assert_eq!(hook_fired.load(Ordering::SeqCst), 1, "the hook ran exactly once");
    assert_eq!(chained_ran.load(Ordering::SeqCst), 0, "the failure bypasses the success arm");
    assert!(!promise.set_value(9), "the late value stays ignored");

    lh.stop();
    loop_thread.join().expect("loop thread exits");
}

#[test]
fn when_n_if_fails_only_after_the_last_input_settles() {
    // 5 staggered inputs, 2 satisfy the predicate, 3 required
    let promises: Vec<Promise<u32>> = (0..5).map(|_| Promise::new()).collect();
    let futures: Vec<_> = promises.iter().map(Promise::future).collect();
    let aggregate = when_n_if(3, futures, |outcome| matches!(outcome, Ok(v) if *v >= 10));

    let setter = thread::spawn(move || {
        for (i, promise) in promises.into_iter().enumerate() {
            thread::sleep(Duration::from_millis(5));
            let value = if i < 2 { 10 + i as u32 } else { i as u32 };
            promise.set_value(value);
        }
    });

    assert!(matches!(aggregate.get(), Err(Failure::NoMatch)), "no partial result is delivered");
    setter.join().expect("setter thread");
}
