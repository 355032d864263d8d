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

//! Reactor-style networking library for high-throughput TCP/UDP servers
//! and clients on POSIX hosts.
//!
//! Three pieces compose the core and agree on lifecycle, threading and
//! error semantics:
//!
//! - an [`EventLoop`] per worker thread, driving a readiness multiplexer
//!   over a set of [`Channel`]s, a timer wheel and a cross-thread wake-up
//!   pipe;
//! - a [`future`] core with continuation chaining, scheduler affinity,
//!   timeouts, unwrapping and combinators;
//! - a [`Connection`] state machine over non-blocking sockets with
//!   pipelined read→process→batch-write, graceful half-close sequencing,
//!   vectored sends and pluggable byte-stream filters (see [`tls`]).
//!
//! Loop callbacks never block: the only blocking points are the
//! multiplexer's bounded poll, [`future::Future::wait`] on non-loop
//! threads, and idle pool workers. The same principle as async runtimes,
//! with a much smaller API surface and no heap of runtime dependencies.

#[macro_use]
extern crate amplify;

pub mod addr;
pub mod app;
pub mod buffer;
mod channel;
pub mod connection;
pub mod datagram;
mod eventloop;
pub mod future;
pub mod pool;
pub mod poller;
pub mod timer;
#[cfg(feature = "tls")]
pub mod tls;

mod acceptor;
mod connector;

pub use acceptor::{Acceptor, LoopSelector};
pub use app::{App, AppError, AppHandle};
pub use buffer::{Buffer, BufferList, SliceList};
pub use channel::{Channel, ChannelId};
pub use connection::{ConnState, Connection, NewConnCallback, SafeSender};
pub use connector::FailCallback;
pub use eventloop::{EventLoop, LoopError, LoopHandle};
pub use future::{Failure, Future, Outcome, Promise, Scheduler, Task};
pub use pool::{PoolHandle, ThreadPool};
pub use timer::{TimerId, FOREVER};
