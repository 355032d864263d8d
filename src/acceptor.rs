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

//! Passive side of connection establishment: a listening-socket channel
//! accepting until `EAGAIN` and handing each new socket to a worker loop.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};

use crate::channel::{Channel, ChannelId};
use crate::connection::{Connection, NewConnCallback};
use crate::eventloop::{EventLoop, LoopHandle};
use crate::poller::Interest;

const LISTEN_BACKLOG: i32 = 1024;
const SOCKET_BUFFER_SIZE: usize = 64 * 1024;

/// Picks the destination loop for the next accepted connection; the
/// application facade installs its round-robin here.
pub type LoopSelector = Arc<dyn Fn() -> LoopHandle + Send + Sync>;

/// Listening-socket channel. Registered read-only on its loop; each
/// accepted socket is promoted to a [`Connection`] on the loop chosen by
/// the selector.
pub struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
    id: ChannelId,
    lp: EventLoop,
    selector: LoopSelector,
    on_new_conn: NewConnCallback,
}

impl Acceptor {
    pub(crate) fn bind(
        lp: EventLoop,
        addr: SocketAddr,
        selector: LoopSelector,
        on_new_conn: NewConnCallback,
    ) -> io::Result<Acceptor> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        // inherited by accepted sockets; not all kernels accept it pre-listen
        let _ = socket.set_nodelay(true);
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from(socket);
        let local = listener.local_addr()?;
        log::info!(target: "acceptor", "listening on {local}");
        Ok(Acceptor { listener, local, id: 0, lp, selector, on_new_conn })
    }

    /// The bound address; resolves ephemeral port requests.
    pub fn local_addr(&self) -> SocketAddr { self.local }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let dst = (self.selector)();
        let on_new_conn = self.on_new_conn.clone();
        dst.post(Box::new(move || bring_up(stream, peer, on_new_conn)));
    }
}

/// Runs on the destination loop: wraps the socket, registers it for read,
/// runs the user hook, then fires the connection's connect hook.
pub(crate) fn bring_up(stream: TcpStream, peer: SocketAddr, on_new_conn: NewConnCallback) {
    let lp = EventLoop::current().expect("connection bring-up runs on a loop thread");
    let conn = match Connection::new(lp.clone(), stream, peer) {
        Ok(conn) => Rc::new(RefCell::new(conn)),
        Err(err) => {
            log::error!(target: "acceptor", "cannot initialize connection from {peer}: {err}");
            return;
        }
    };
    match lp.register(Interest::read_only(), conn.clone()) {
        Ok(_) => {
            let mut conn = conn.borrow_mut();
            on_new_conn(&mut conn);
            conn.fire_connect();
        }
        Err(err) => {
            log::error!(target: "acceptor", "cannot register connection from {peer}: {err}");
        }
    }
}

impl Channel for Acceptor {
    fn fd(&self) -> RawFd { self.listener.as_raw_fd() }

    fn id(&self) -> ChannelId { self.id }

    fn set_id(&mut self, id: ChannelId) { self.id = id; }

    fn handle_read(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!(target: "acceptor", "accepted {peer} on {}", self.local);
                    self.spawn_connection(stream, peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) => match err.raw_os_error() {
                    // transient per-connection failures: keep accepting
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => {
                        continue
                    }
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        log::error!(
                            target: "acceptor",
                            "out of file descriptors while accepting on {}: {err}",
                            self.local
                        );
                        return true;
                    }
                    Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
                        log::error!(
                            target: "acceptor",
                            "out of socket memory while accepting on {}: {err}",
                            self.local
                        );
                        return true;
                    }
                    _ => {
                        log::error!(
                            target: "acceptor",
                            "accept failed on {}: {err}",
                            self.local
                        );
                        return false;
                    }
                },
            }
        }
    }

    fn handle_write(&mut self) -> bool {
        debug_assert!(false, "acceptor is never registered for write");
        false
    }

    fn handle_error(&mut self) {
        log::error!(target: "acceptor", "error event on listener {}", self.local);
        self.lp.unregister(self.fd(), self.id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
