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

//! Abstract readiness multiplexer with one backend per host OS kernel
//! facility: event-poll on Linux, kernel-queue on macOS and FreeBSD.

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub mod kqueue;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// The event mask a file descriptor is registered with.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn read_only() -> Self { Interest { read: true, write: false } }

    pub fn write_only() -> Self { Interest { read: false, write: true } }

    pub fn read_write() -> Self { Interest { read: true, write: true } }

    pub fn none() -> Self { Interest { read: false, write: false } }

    pub fn is_none(self) -> bool { !self.read && !self.write }
}

/// A readiness report for one registered descriptor.
///
/// `error` covers hang-up and poll error conditions; the loop routes it to
/// the channel's error hook before read or write.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoEvent {
    /// Opaque registration token; the loop keys channels by it.
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Readiness multiplexer: register descriptors with an event mask and an
/// opaque token, block for readiness, then iterate fired events.
///
/// `modify` on an unknown descriptor falls back to `register`, and
/// `register` on a duplicate falls back to `modify`: interest sets may be
/// updated repeatedly by user code.
pub trait Poll: Iterator<Item = IoEvent> {
    fn register(&mut self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()>;

    fn modify(&mut self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()>;

    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until readiness or timeout (`None` blocks indefinitely).
    /// Returns the number of fired events queued for iteration; an
    /// interrupted wait reports zero.
    fn poll(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Constructs the multiplexer native to the host kernel.
pub fn default_poller() -> io::Result<Box<dyn Poll>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::Epoll::new()?))
    }
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    {
        Ok(Box::new(kqueue::Kqueue::new()?))
    }
}

#[cfg(target_os = "linux")]
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn reports_readable_after_write() {
        let (left, mut right) = UnixStream::pair().expect("socketpair");
        left.set_nonblocking(true).expect("nonblocking");

        let mut poller = default_poller().expect("poller");
        poller.register(left.as_raw_fd(), Interest::read_only(), 7).expect("register");

        let fired = poller.poll(8, Some(Duration::from_millis(10))).expect("poll");
        assert_eq!(fired, 0, "nothing to read yet");

        right.write_all(b"x").expect("write");
        let fired = poller.poll(8, Some(Duration::from_millis(1000))).expect("poll");
        assert_eq!(fired, 1);
        let ev = poller.next().expect("fired event");
        assert_eq!(ev.token, 7);
        assert!(ev.readable);
        assert!(!ev.writable);
    }

    #[test]
    fn register_is_idempotent_and_modify_falls_back() {
        let (left, _right) = UnixStream::pair().expect("socketpair");
        let fd = left.as_raw_fd();

        let mut poller = default_poller().expect("poller");
        poller.register(fd, Interest::read_only(), 1).expect("register");
        poller.register(fd, Interest::read_write(), 1).expect("duplicate register degrades");
        poller.unregister(fd).expect("unregister");
        poller.modify(fd, Interest::write_only(), 1).expect("modify on unknown fd registers");

        let fired = poller.poll(8, Some(Duration::from_millis(1000))).expect("poll");
        assert_eq!(fired, 1);
        assert!(poller.next().expect("event").writable);
    }
}
