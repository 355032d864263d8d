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

//! Active side of connection establishment: non-blocking `connect` tracked
//! by write readiness, guarded by an optional timeout timer.
//!
//! Success and failure are mutually exclusive: the first outcome resolves
//! the connector and cancels the loser — in particular the timeout timer is
//! always canceled explicitly on success, so its hook cannot race the
//! connection bring-up.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::acceptor::bring_up;
use crate::channel::{Channel, ChannelId};
use crate::connection::NewConnCallback;
use crate::eventloop::{EventLoop, LoopError, LoopHandle};
use crate::poller::Interest;
use crate::timer::TimerId;

/// Invoked once when the connect attempt fails or times out.
pub type FailCallback = Box<dyn FnOnce(SocketAddr, io::Error) + Send>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Phase {
    Pending,
    Resolved,
}

/// In-flight outbound connection attempt, registered write-only.
pub struct Connector {
    sock: Option<Socket>,
    dst: SocketAddr,
    id: ChannelId,
    lp: EventLoop,
    dst_loop: LoopHandle,
    on_new_conn: NewConnCallback,
    on_fail: Option<FailCallback>,
    timeout_timer: Option<TimerId>,
    phase: Phase,
}

impl Connector {
    pub(crate) fn start(
        lp: &EventLoop,
        dst: SocketAddr,
        on_new_conn: NewConnCallback,
        on_fail: FailCallback,
        timeout: Option<Duration>,
        dst_loop: Option<LoopHandle>,
    ) -> Result<(), LoopError> {
        let socket = Socket::new(Domain::for_address(dst), Type::STREAM, None)?;
        socket.set_nonblocking(true)?;

        match socket.connect(&dst.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                log::warn!(target: "connector", "connect to {dst} failed at once: {err}");
                on_fail(dst, err);
                return Ok(());
            }
        }

        let connector = Rc::new(RefCell::new(Connector {
            sock: Some(socket),
            dst,
            id: 0,
            lp: lp.clone(),
            dst_loop: dst_loop.unwrap_or_else(|| lp.handle()),
            on_new_conn,
            on_fail: Some(on_fail),
            timeout_timer: None,
            phase: Phase::Pending,
        }));

        let id = match lp.register(Interest::write_only(), connector.clone()) {
            Ok(id) => id,
            Err(err) => {
                let mut pending = connector.borrow_mut();
                if let Some(fail) = pending.on_fail.take() {
                    fail(dst, io::Error::new(io::ErrorKind::Other, err.to_string()));
                }
                return Ok(());
            }
        };

        if let Some(timeout) = timeout {
            let watch = lp.clone();
            let timer = lp.schedule_after(timeout, move || Connector::expire(&watch, id));
            connector.borrow_mut().timeout_timer = Some(timer);
        }
        log::debug!(target: "connector", "connecting to {dst}");
        Ok(())
    }

    /// Timeout-timer body: fails the attempt if still pending.
    fn expire(lp: &EventLoop, id: ChannelId) {
        let Some(channel) = lp.channel(id) else { return };
        let mut channel = channel.borrow_mut();
        let Some(connector) = channel.as_any_mut().downcast_mut::<Connector>() else { return };
        if connector.phase != Phase::Pending {
            return;
        }
        log::warn!(target: "connector", "connect to {} timed out", connector.dst);
        connector.timeout_timer = None;
        connector.resolve_failure(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
    }

    fn resolve_success(&mut self) {
        self.phase = Phase::Resolved;
        if let Some(timer) = self.timeout_timer.take() {
            self.lp.cancel(timer);
        }

        let fd = self.fd();
        self.lp.unregister(fd, self.id);
        let stream: TcpStream = self.sock.take().expect("pending connector owns its socket").into();
        log::debug!(target: "connector", "connected to {}", self.dst);

        let peer = self.dst;
        let on_new_conn = self.on_new_conn.clone();
        self.dst_loop.post(Box::new(move || bring_up(stream, peer, on_new_conn)));
    }

    fn resolve_failure(&mut self, err: io::Error) {
        self.phase = Phase::Resolved;
        if let Some(timer) = self.timeout_timer.take() {
            self.lp.cancel(timer);
        }
        log::warn!(target: "connector", "connect to {} failed: {err}", self.dst);
        let fd = self.fd();
        let dst = self.dst;
        if let Some(fail) = self.on_fail.take() {
            fail(dst, err);
        }
        self.lp.unregister(fd, self.id);
    }
}

impl Channel for Connector {
    fn fd(&self) -> RawFd {
        self.sock.as_ref().map_or(-1, |sock| sock.as_raw_fd())
    }

    fn id(&self) -> ChannelId { self.id }

    fn set_id(&mut self, id: ChannelId) { self.id = id; }

    fn handle_read(&mut self) -> bool { true }

    fn handle_write(&mut self) -> bool {
        if self.phase != Phase::Pending {
            return true;
        }
        let probe = self.sock.as_ref().expect("pending connector owns its socket").take_error();
        match probe {
            Ok(None) => self.resolve_success(),
            Ok(Some(err)) | Err(err) => self.resolve_failure(err),
        }
        true
    }

    fn handle_error(&mut self) {
        if self.phase != Phase::Pending {
            return;
        }
        let err = self
            .sock
            .as_ref()
            .and_then(|sock| sock.take_error().ok().flatten())
            .unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "connect failed")
            });
        self.resolve_failure(err);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
