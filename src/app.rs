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

//! Application facade: one base loop plus worker loops, round-robin
//! distribution of accepted connections, and lifecycle fan-out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{fmt, io};

use crossbeam_channel as chan;

use crate::addr::{self, AddrError};
use crate::connection::NewConnCallback;
use crate::connector::FailCallback;
use crate::datagram::DatagramCallback;
use crate::eventloop::{EventLoop, LoopError, LoopHandle};

/// Worker-loop ceiling, matching the thread-pool cap.
const MAX_WORKERS: usize = 512;

#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum AppError {
    #[from]
    Addr(AddrError),

    #[from]
    Io(io::Error),

    #[from]
    Loop(LoopError),
}

struct RoundRobin {
    base: LoopHandle,
    workers: Vec<LoopHandle>,
    next: AtomicUsize,
}

impl RoundRobin {
    /// The next worker loop; the base loop when no workers exist.
    fn next_loop(&self) -> LoopHandle {
        if self.workers.is_empty() {
            return self.base.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }
}

/// Multi-loop application driver.
///
/// Owns the base loop (constructed on the calling thread) and one loop per
/// worker thread. Accepted connections distribute round-robin over the
/// workers. Setup — listen, connect — happens before [`App::run`], on the
/// constructing thread.
pub struct App {
    base: EventLoop,
    selector: Arc<RoundRobin>,
    threads: Vec<JoinHandle<()>>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App").field("workers", &self.selector.workers.len()).finish_non_exhaustive()
    }
}

impl App {
    /// Builds the base loop here and spawns `workers` worker-loop threads,
    /// collecting their handles before returning.
    pub fn new(workers: usize) -> Result<App, AppError> {
        assert!(workers <= MAX_WORKERS, "worker count over the {MAX_WORKERS} ceiling");

        let base = EventLoop::new()?;
        let (handle_send, handle_recv) = chan::bounded(workers.max(1));

        let mut threads = Vec::with_capacity(workers);
        for n in 0..workers {
            let handle_send = handle_send.clone();
            let thread = thread::Builder::new().name(format!("netloop-worker-{n}")).spawn(
                move || {
                    let lp = EventLoop::new().expect("cannot construct worker event loop");
                    handle_send
                        .send(lp.handle())
                        .expect("application waits for worker handles");
                    lp.run();
                },
            )?;
            threads.push(thread);
        }

        let worker_handles = (0..workers)
            .map(|_| handle_recv.recv().expect("worker thread delivers its handle"))
            .collect();

        Ok(App {
            selector: Arc::new(RoundRobin {
                base: base.handle(),
                workers: worker_handles,
                next: AtomicUsize::new(0),
            }),
            base,
            threads,
        })
    }

    /// The base loop, for direct scheduling before `run`.
    pub fn base(&self) -> &EventLoop { &self.base }

    /// Cross-thread control handle over all loops.
    pub fn handle(&self) -> AppHandle {
        AppHandle { selector: self.selector.clone() }
    }

    /// The loop the next accepted connection would land on.
    pub fn next_loop(&self) -> LoopHandle { self.selector.next_loop() }

    /// Starts listening on `ip:port` (`ip` may be [`addr::LOOPBACK`]);
    /// returns the bound address so an ephemeral port can be observed.
    pub fn listen(
        &self,
        ip: &str,
        port: u16,
        on_new_conn: NewConnCallback,
    ) -> Result<SocketAddr, AppError> {
        let target = addr::socket_addr(ip, port)?;
        let selector = self.selector.clone();
        let bound =
            self.base.listen_with(target, Arc::new(move || selector.next_loop()), on_new_conn)?;
        Ok(bound)
    }

    /// Binds a UDP datagram channel on the base loop.
    pub fn listen_udp(
        &self,
        ip: &str,
        port: u16,
        on_datagram: DatagramCallback,
    ) -> Result<SocketAddr, AppError> {
        let target = addr::socket_addr(ip, port)?;
        Ok(self.base.listen_udp(target, on_datagram)?)
    }

    /// Starts an outbound connection from the base loop; the established
    /// connection lands on the next round-robin loop.
    pub fn connect(
        &self,
        ip: &str,
        port: u16,
        on_new_conn: NewConnCallback,
        on_fail: FailCallback,
        timeout: Option<Duration>,
    ) -> Result<(), AppError> {
        let target = addr::socket_addr(ip, port)?;
        let dst = self.selector.next_loop();
        self.base.connect(target, on_new_conn, on_fail, timeout, Some(dst))?;
        Ok(())
    }

    /// Drives the base loop until stopped, then stops and joins the worker
    /// loops.
    pub fn run(self) {
        self.base.run();
        for worker in &self.selector.workers {
            worker.stop();
        }
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Cloneable, `Send` control handle for a running [`App`].
#[derive(Clone)]
pub struct AppHandle {
    selector: Arc<RoundRobin>,
}

impl AppHandle {
    /// Requests every loop to stop; [`App::run`] returns soon after.
    pub fn stop(&self) {
        self.selector.base.stop();
        for worker in &self.selector.workers {
            worker.stop();
        }
    }

    /// Round-robin selection, usable from any thread.
    pub fn next_loop(&self) -> LoopHandle { self.selector.next_loop() }

    /// The base loop's handle.
    pub fn base_loop(&self) -> LoopHandle { self.selector.base.clone() }
}
