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

//! TCP connection state machine: pipelined read, response batching,
//! vectored sends and graceful half-close sequencing.

use std::any::Any;
use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::buffer::{Buffer, BufferList, SliceList};
use crate::channel::{Channel, ChannelId};
use crate::eventloop::{EventLoop, LoopHandle};
use crate::poller::Interest;

/// Bytes of receive-buffer space guaranteed before every read.
const RECV_CHUNK: usize = 8 * 1024;
/// Vectored-write cap per syscall, sized against typical `IOV_MAX`.
const IOVEC_BATCH: usize = 64;

/// Callback run on the destination loop for each established connection.
pub type NewConnCallback = Arc<dyn Fn(&mut Connection) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum ConnState {
    /// Not yet bound to a socket.
    None,

    /// Established; reads and writes flow.
    Connected,

    /// No longer readable; the send buffer must drain before termination.
    CloseWaitWrite,

    /// Peer initiated the close (or a drained half-close completed).
    PassiveClose,

    /// Local close with an empty send buffer; FIN already sent.
    ActiveClose,

    /// Terminal I/O failure.
    Error,

    /// Fully closed; about to be unregistered.
    Closed,
}

type ConnCallback = Box<dyn FnMut(&mut Connection)>;
type MessageCallback = Box<dyn FnMut(&mut Connection, &[u8]) -> usize>;

/// A non-blocking TCP connection owned by one event loop.
///
/// All mutation happens on the owning loop thread; other threads go through
/// a [`SafeSender`]. The message handler receives the readable bytes and
/// returns how many it consumed — 0 means "need more bytes, stop".
pub struct Connection {
    lp: EventLoop,
    sock: TcpStream,
    peer: SocketAddr,
    id: ChannelId,
    state: ConnState,
    recv_buf: Buffer,
    send_buf: BufferList,
    batch_buf: Buffer,
    batching: bool,
    processing_read: bool,
    min_packet_size: usize,
    on_connect: Option<ConnCallback>,
    on_disconnect: Option<ConnCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<ConnCallback>,
    context: Option<Box<dyn Any>>,
}

impl Connection {
    /// Wraps an established socket; the stream is switched to non-blocking.
    pub fn new(lp: EventLoop, sock: TcpStream, peer: SocketAddr) -> io::Result<Connection> {
        sock.set_nonblocking(true)?;
        let mut conn = Connection {
            lp,
            sock,
            peer,
            id: 0,
            state: ConnState::None,
            recv_buf: Buffer::new(),
            send_buf: BufferList::new(),
            batch_buf: Buffer::new(),
            batching: true,
            processing_read: false,
            min_packet_size: 1,
            on_connect: None,
            on_disconnect: None,
            on_message: None,
            on_write_complete: None,
            context: None,
        };
        conn.state = ConnState::Connected;
        Ok(conn)
    }

    pub fn state(&self) -> ConnState { self.state }

    pub fn peer_addr(&self) -> SocketAddr { self.peer }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.sock.local_addr() }

    pub fn set_nodelay(&self, enable: bool) -> io::Result<()> { self.sock.set_nodelay(enable) }

    /// Handler bytes threshold: the message callback only runs once at least
    /// this many bytes are readable.
    pub fn set_min_packet_size(&mut self, size: usize) {
        self.min_packet_size = size.max(1);
    }

    pub fn min_packet_size(&self) -> usize { self.min_packet_size }

    /// Toggles response batching: when on (the default), sends issued while
    /// a read dispatch is in progress accumulate and flush as one vectored
    /// send on exit. Turn off for strict request/response workloads.
    pub fn set_batch_send(&mut self, batch: bool) { self.batching = batch; }

    pub fn set_on_connect(&mut self, cb: impl FnMut(&mut Connection) + 'static) {
        self.on_connect = Some(Box::new(cb));
    }

    pub fn set_on_disconnect(&mut self, cb: impl FnMut(&mut Connection) + 'static) {
        self.on_disconnect = Some(Box::new(cb));
    }

    /// Installs the message handler. A handler may install a different
    /// handler for the following bytes during its own invocation (the TLS
    /// filter swaps from handshake to data phase this way).
    pub fn set_on_message(&mut self, cb: impl FnMut(&mut Connection, &[u8]) -> usize + 'static) {
        self.on_message = Some(Box::new(cb));
    }

    pub fn set_on_write_complete(&mut self, cb: impl FnMut(&mut Connection) + 'static) {
        self.on_write_complete = Some(Box::new(cb));
    }

    /// Attaches arbitrary user state to this connection.
    pub fn set_context<C: 'static>(&mut self, context: C) {
        self.context = Some(Box::new(context));
    }

    pub fn context_mut<C: 'static>(&mut self) -> Option<&mut C> {
        self.context.as_mut()?.downcast_mut()
    }

    /// Handle for sending from other threads; re-posts onto the owning loop.
    pub fn sender(&self) -> SafeSender {
        SafeSender { lp: self.lp.handle(), id: self.id }
    }

    /// Queues `data` for the peer. Tries a direct write when nothing is
    /// buffered and no batching pass is active; a short write or `EAGAIN`
    /// buffers the remainder and enables write interest.
    pub fn send(&mut self, data: &[u8]) -> bool {
        debug_assert!(self.lp.in_this_loop(), "send belongs to the loop thread");
        if data.is_empty() {
            return true;
        }
        if self.state != ConnState::Connected && self.state != ConnState::CloseWaitWrite {
            return false;
        }

        if !self.send_buf.is_empty() {
            self.send_buf.push(data);
            return true;
        }
        if self.processing_read && self.batching {
            self.batch_buf.push(data);
            return true;
        }

        let sent = match write_some(&mut self.sock, data) {
            Ok(sent) => sent,
            Err(err) => {
                log::error!(target: "conn", "fd {} send failed: {err}", self.fd());
                self.shutdown_socket(Shutdown::Both);
                self.state = ConnState::Error;
                let _ = self.lp.modify(Interest::write_only(), self.fd(), self.id);
                return false;
            }
        };

        if sent < data.len() {
            log::warn!(
                target: "conn",
                "fd {} wanted to send {} bytes but only sent {sent}",
                self.fd(),
                data.len()
            );
            self.send_buf.push(&data[sent..]);
            let _ = self.lp.modify(Interest::read_write(), self.fd(), self.id);
        } else {
            self.fire_write_complete();
        }
        true
    }

    /// Queues a list of buffers as one scatter/gather send.
    pub fn send_list(&mut self, data: &BufferList) -> bool {
        let mut slices = SliceList::new();
        for buf in data.iter() {
            slices.push(buf.readable());
        }
        self.send_slices(&slices)
    }

    /// Queues borrowed slices as one scatter/gather send, at most
    /// [`IOVEC_BATCH`] iovecs per syscall.
    pub fn send_slices(&mut self, slices: &SliceList) -> bool {
        debug_assert!(self.lp.in_this_loop(), "send belongs to the loop thread");
        if slices.is_empty() {
            return true;
        }
        if self.state != ConnState::Connected && self.state != ConnState::CloseWaitWrite {
            return false;
        }

        if !self.send_buf.is_empty() {
            for slice in slices.iter() {
                self.send_buf.push(slice);
            }
            return true;
        }
        if self.processing_read && self.batching {
            for slice in slices.iter() {
                self.batch_buf.push(slice);
            }
            return true;
        }

        let expect = slices.total_bytes();
        let iovecs: Vec<&[u8]> = slices.iter().copied().collect();
        let sent = match writev(&mut self.sock, &iovecs) {
            Ok(sent) => sent,
            Err(err) => {
                log::error!(target: "conn", "fd {} vectored send failed: {err}", self.fd());
                self.shutdown_socket(Shutdown::Both);
                self.state = ConnState::Error;
                let _ = self.lp.modify(Interest::write_only(), self.fd(), self.id);
                return false;
            }
        };

        if sent < expect {
            collect_remainder(&iovecs, sent, &mut self.send_buf);
            let _ = self.lp.modify(Interest::read_write(), self.fd(), self.id);
        } else {
            self.fire_write_complete();
        }
        true
    }

    /// Initiates a local close. With a drained send buffer the FIN goes out
    /// now; otherwise the connection half-closes and terminates once the
    /// pending bytes are flushed.
    pub fn active_close(&mut self) {
        if self.state == ConnState::None || self.state == ConnState::Closed {
            return;
        }
        if self.send_buf.is_empty() {
            self.shutdown_socket(Shutdown::Both);
            self.state = ConnState::ActiveClose;
        } else {
            self.state = ConnState::CloseWaitWrite;
            self.shutdown_socket(Shutdown::Read);
        }
        let _ = self.lp.modify(Interest::write_only(), self.fd(), self.id);
    }

    /// Issues the half-close. Shutting down the write side with pending
    /// send data discards it with a warning.
    pub fn shutdown(&mut self, how: Shutdown) {
        if matches!(how, Shutdown::Write | Shutdown::Both) && !self.send_buf.is_empty() {
            log::warn!(
                target: "conn",
                "fd {} shutdown discards {} unsent bytes",
                self.fd(),
                self.send_buf.total_bytes()
            );
            self.send_buf.clear();
        }
        self.shutdown_socket(how);
    }

    /// Fires the connect hook; called once by the acceptor/connector task
    /// after registration.
    pub(crate) fn fire_connect(&mut self) {
        if self.state != ConnState::Connected {
            return;
        }
        if let Some(mut cb) = self.on_connect.take() {
            cb(self);
            if self.on_connect.is_none() {
                self.on_connect = Some(cb);
            }
        }
    }

    fn fire_write_complete(&mut self) {
        if let Some(mut cb) = self.on_write_complete.take() {
            cb(self);
            if self.on_write_complete.is_none() {
                self.on_write_complete = Some(cb);
            }
        }
    }

    fn shutdown_socket(&self, how: Shutdown) {
        let _ = self.sock.shutdown(how);
    }

    /// Drains the socket and dispatches complete messages until `EAGAIN`.
    fn read_some(&mut self) -> bool {
        let mut busy = false;
        loop {
            self.recv_buf.assure_space(RECV_CHUNK);
            let bytes = match self.sock.read(self.recv_buf.writable()) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if busy {
                        self.recv_buf.shrink();
                    }
                    return true;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!(target: "conn", "fd {} read failed: {err}", self.fd());
                    self.shutdown_socket(Shutdown::Both);
                    self.state = ConnState::Error;
                    return false;
                }
            };

            if bytes == 0 {
                log::debug!(target: "conn", "fd {} peer sent EOF", self.fd());
                if self.send_buf.is_empty() {
                    self.shutdown_socket(Shutdown::Both);
                    self.state = ConnState::PassiveClose;
                } else {
                    self.state = ConnState::CloseWaitWrite;
                    self.shutdown_socket(Shutdown::Read);
                    let _ = self.lp.modify(Interest::write_only(), self.fd(), self.id);
                }
                return false;
            }

            self.recv_buf.produce(bytes);

            let mut pending = mem::take(&mut self.recv_buf);
            while pending.readable_len() >= self.min_packet_size {
                let consumed = match self.on_message.take() {
                    Some(mut cb) => {
                        let consumed = cb(self, pending.readable());
                        // the handler may have installed its successor
                        if self.on_message.is_none() {
                            self.on_message = Some(cb);
                        }
                        consumed
                    }
                    // without a handler the connection echoes
                    None => {
                        let all = pending.readable_len();
                        self.send(pending.readable());
                        all
                    }
                };
                if consumed == 0 {
                    break;
                }
                pending.consume(consumed);
                busy = true;
            }
            self.recv_buf = pending;
        }
    }
}

impl Channel for Connection {
    fn fd(&self) -> RawFd { self.sock.as_raw_fd() }

    fn id(&self) -> ChannelId { self.id }

    fn set_id(&mut self, id: ChannelId) { self.id = id; }

    fn handle_read(&mut self) -> bool {
        if self.state != ConnState::Connected {
            log::error!(
                target: "conn",
                "fd {} read event in state {:?}",
                self.fd(),
                self.state
            );
            return false;
        }

        self.processing_read = true;
        let keep = self.read_some();
        self.processing_read = false;

        if !self.batch_buf.is_empty() {
            let batch = mem::take(&mut self.batch_buf);
            self.send(batch.readable());
        }
        keep
    }

    fn handle_write(&mut self) -> bool {
        if self.state != ConnState::Connected && self.state != ConnState::CloseWaitWrite {
            log::error!(
                target: "conn",
                "fd {} write event in state {:?}",
                self.fd(),
                self.state
            );
            return false;
        }

        let expect = self.send_buf.total_bytes();
        let result = {
            let iovecs: Vec<&[u8]> = self.send_buf.iter().map(Buffer::readable).collect();
            writev(&mut self.sock, &iovecs)
        };
        let sent = match result {
            Ok(sent) => sent,
            Err(err) => {
                log::error!(target: "conn", "fd {} flush failed: {err}", self.fd());
                self.shutdown_socket(Shutdown::Both);
                self.state = ConnState::Error;
                return false;
            }
        };
        self.send_buf.consume(sent);

        if sent == expect {
            let _ = self.lp.modify(Interest::read_only(), self.fd(), self.id);
            self.fire_write_complete();
            if self.state == ConnState::CloseWaitWrite {
                self.state = ConnState::PassiveClose;
                return false;
            }
        }
        true
    }

    fn handle_error(&mut self) {
        log::debug!(target: "conn", "fd {} error event in state {:?}", self.fd(), self.state);
        match self.state {
            ConnState::PassiveClose | ConnState::ActiveClose | ConnState::Error => {}
            // a live connection reports errors through its read/write paths
            _ => return,
        }

        self.state = ConnState::Closed;
        if let Some(mut cb) = self.on_disconnect.take() {
            cb(self);
        }
        self.lp.unregister(self.fd(), self.id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

/// Cross-thread send handle: re-posts the payload as a task on the owning
/// loop, where it is delivered through the regular send path.
#[derive(Clone)]
pub struct SafeSender {
    lp: LoopHandle,
    id: ChannelId,
}

impl SafeSender {
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let id = self.id;
        if self.lp.is_current() {
            deliver(id, &data);
        } else {
            self.lp.post(Box::new(move || deliver(id, &data)));
        }
    }
}

fn deliver(id: ChannelId, data: &[u8]) {
    let lp = EventLoop::current().expect("delivery task runs on the loop thread");
    let Some(channel) = lp.channel(id) else {
        log::debug!(target: "conn", "safe send raced connection {id} teardown");
        return;
    };
    let mut channel = channel.borrow_mut();
    if let Some(conn) = channel.as_any_mut().downcast_mut::<Connection>() {
        conn.send(data);
    }
}

/// Non-blocking single-buffer write; `EAGAIN`/`EINTR` report 0 bytes.
fn write_some(sock: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    match sock.write(data) {
        Ok(sent) => Ok(sent),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

/// Vectored write over `iovecs`, at most [`IOVEC_BATCH`] per syscall.
/// Returns bytes sent; a short batch or `EAGAIN` stops early.
fn writev(sock: &mut TcpStream, iovecs: &[&[u8]]) -> io::Result<usize> {
    let mut sent = 0usize;
    let mut next = 0usize;
    while next < iovecs.len() {
        let batch_end = (next + IOVEC_BATCH).min(iovecs.len());
        let batch: Vec<IoSlice> =
            iovecs[next..batch_end].iter().map(|slice| IoSlice::new(slice)).collect();
        let expect: usize = batch.iter().map(|slice| slice.len()).sum();

        match sock.write_vectored(&batch) {
            Ok(bytes) => {
                sent += bytes;
                if bytes < expect {
                    return Ok(sent);
                }
                next = batch_end;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(sent),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(sent)
}

/// Buffers the unsent tail of a partially-written iovec sequence.
fn collect_remainder(iovecs: &[&[u8]], mut skipped: usize, dst: &mut BufferList) {
    for slice in iovecs {
        if skipped >= slice.len() {
            skipped -= slice.len();
        } else {
            dst.push(&slice[skipped..]);
            skipped = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_collection_skips_sent_prefix() {
        let a: &[u8] = b"aaaa";
        let b: &[u8] = b"bbbb";
        let c: &[u8] = b"cccc";
        let mut dst = BufferList::new();
        collect_remainder(&[a, b, c], 6, &mut dst);
        assert_eq!(dst.total_bytes(), 6);
        let collected: Vec<u8> =
            dst.iter().flat_map(|buf| buf.readable().to_vec()).collect();
        assert_eq!(collected, b"bbcccc");
    }
}
