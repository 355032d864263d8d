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

//! Fixed-size worker pool for CPU-bound work, with a future-returning
//! submit.
//!
//! ```no_run
//! # use netloop::pool::ThreadPool;
//! let pool = ThreadPool::new();
//! let answer = pool.execute(|| 21 * 2).get();
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::{any::Any, thread};

use crossbeam_channel as chan;

use crate::future::{make_failed_future, Failure, Future, Promise, Scheduler, Task};

/// Hard ceiling on worker threads.
const MAX_THREADS: usize = 512;

struct PoolState {
    num_threads: usize,
    workers: Vec<JoinHandle<()>>,
    sender: Option<chan::Sender<Task>>,
    shutdown: bool,
}

/// A fixed-size thread pool consuming an unbounded FIFO work queue.
///
/// The size is set before the first submit (default 1) and fixed once the
/// workers start, which happens lazily on first use. Shutdown drains
/// in-flight work, rejects further submits and joins the workers.
pub struct ThreadPool {
    state: Mutex<PoolState>,
}

impl Default for ThreadPool {
    fn default() -> Self { ThreadPool::new() }
}

impl ThreadPool {
    pub fn new() -> Self {
        ThreadPool {
            state: Mutex::new(PoolState {
                num_threads: 1,
                workers: Vec::new(),
                sender: None,
                shutdown: false,
            }),
        }
    }

    /// Sets the worker count; a programmer error once the pool has started.
    pub fn set_num_threads(&self, num: usize) {
        let mut state = self.state.lock().expect("thread pool state poisoned");
        assert!(state.workers.is_empty(), "thread pool size is fixed after start");
        assert!(num >= 1 && num <= MAX_THREADS, "thread pool size out of range");
        state.num_threads = num;
    }

    /// Submits `f` for execution on a worker thread.
    ///
    /// The returned future carries `f`'s return value, or
    /// [`Failure::Panic`] when `f` panics, or [`Failure::Rejected`] when the
    /// pool is already shut down.
    pub fn execute<F, T>(&self, f: F) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut state = self.state.lock().expect("thread pool state poisoned");
        if state.shutdown {
            return make_failed_future(Failure::Rejected);
        }
        if state.workers.is_empty() {
            Self::start(&mut state);
        }

        let promise = Promise::new();
        let future = promise.future();
        let task: Task = Box::new(move || match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                promise.set_value(value);
            }
            Err(payload) => {
                promise.set_failure(Failure::Panic(panic_message(payload)));
            }
        });
        state
            .sender
            .as_ref()
            .expect("started pool keeps its queue sender")
            .send(task)
            .expect("workers hold the receiver while the sender lives");
        future
    }

    /// A cloneable, `Send` submission handle; starts the workers if needed.
    pub fn handle(&self) -> PoolHandle {
        let mut state = self.state.lock().expect("thread pool state poisoned");
        assert!(!state.shutdown, "thread pool is shut down");
        if state.workers.is_empty() {
            Self::start(&mut state);
        }
        PoolHandle {
            sender: state.sender.as_ref().expect("started pool keeps its queue sender").clone(),
        }
    }

    /// Stops the pool: pending work drains, further submits are rejected,
    /// and all workers are joined.
    pub fn join_all(&self) {
        let workers = {
            let mut state = self.state.lock().expect("thread pool state poisoned");
            state.shutdown = true;
            state.sender = None;
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Worker count; 0 until the lazy start.
    pub fn worker_threads(&self) -> usize {
        self.state.lock().expect("thread pool state poisoned").workers.len()
    }

    /// Tasks waiting in the queue.
    pub fn tasks(&self) -> usize {
        self.state
            .lock()
            .expect("thread pool state poisoned")
            .sender
            .as_ref()
            .map_or(0, chan::Sender::len)
    }

    fn start(state: &mut PoolState) {
        let (sender, receiver) = chan::unbounded::<Task>();
        for n in 0..state.num_threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("netloop-pool-{n}"))
                .spawn(move || {
                    // recv errors once the sender is dropped and the queue drained
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("cannot spawn pool worker thread");
            state.workers.push(worker);
        }
        state.sender = Some(sender);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) { self.join_all(); }
}

/// Cross-thread submission handle to a running [`ThreadPool`].
#[derive(Clone)]
pub struct PoolHandle {
    sender: chan::Sender<Task>,
}

impl PoolHandle {
    /// Posts fire-and-forget work; silently dropped when the pool has shut
    /// down.
    pub fn post(&self, task: Task) { let _ = self.sender.send(task); }
}

impl Scheduler for PoolHandle {
    fn schedule(&self, task: Task) { self.post(task); }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => s!("opaque panic payload"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn executes_and_returns_value() {
        let pool = ThreadPool::new();
        let result = pool.execute(|| 6 * 7).get();
        assert_eq!(result.expect("computed on a worker"), 42);
    }

    #[test]
    fn work_runs_off_the_submitting_thread() {
        let pool = ThreadPool::new();
        let submitter = thread::current().id();
        let worker = pool.execute(thread::current).get().expect("worker identity");
        assert_ne!(worker.id(), submitter);
    }

    #[test]
    fn queue_is_fifo_per_producer() {
        let pool = ThreadPool::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        for i in 0..16 {
            let order = order.clone();
            futures.push(pool.execute(move || order.lock().expect("order").push(i)));
        }
        for future in futures {
            future.get().expect("task ran");
        }
        assert_eq!(*order.lock().expect("order"), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn panic_becomes_failure() {
        let pool = ThreadPool::new();
        let result = pool.execute(|| -> u32 { panic!("boom") }).get();
        match result {
            Err(Failure::Panic(message)) => assert!(message.contains("boom")),
            other => panic!("expected a panic failure, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_drains_then_rejects() {
        let pool = ThreadPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            let _ = pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 8, "in-flight work drained");
        assert!(matches!(pool.execute(|| 1).get(), Err(Failure::Rejected)));
    }

    #[test]
    fn size_is_configurable_before_start() {
        let pool = ThreadPool::new();
        pool.set_num_threads(4);
        let _ = pool.execute(|| ()).get();
        assert_eq!(pool.worker_threads(), 4);
    }
}
