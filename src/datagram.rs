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

//! UDP datagram channel.
//!
//! Shares the channel contract with TCP connections where it can; the
//! differences are the datagram boundaries — messages are delivered whole,
//! and a send blocked by `EAGAIN` queues the entire datagram rather than a
//! byte tail.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::{cmp, mem};

use crate::channel::{Channel, ChannelId};
use crate::eventloop::EventLoop;
use crate::poller::Interest;

/// Largest datagram accepted from the kernel.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Per-datagram handler: the full message and its source address.
pub type DatagramCallback = Arc<dyn Fn(&mut DatagramSocket, &[u8], SocketAddr) + Send + Sync>;

/// A non-blocking UDP socket channel owned by one event loop.
pub struct DatagramSocket {
    sock: UdpSocket,
    id: ChannelId,
    lp: EventLoop,
    on_datagram: Option<DatagramCallback>,
    pending: VecDeque<(Vec<u8>, SocketAddr)>,
    recv_buf: Vec<u8>,
}

impl DatagramSocket {
    /// Server-side socket bound to `addr`.
    pub(crate) fn bind(
        lp: EventLoop,
        addr: SocketAddr,
        on_datagram: DatagramCallback,
    ) -> io::Result<DatagramSocket> {
        let sock = UdpSocket::bind(addr)?;
        sock.set_nonblocking(true)?;
        log::info!(target: "udp", "datagram socket on {}", sock.local_addr()?);
        Ok(DatagramSocket {
            sock,
            id: 0,
            lp,
            on_datagram: Some(on_datagram),
            pending: empty!(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Client-side socket bound to an ephemeral local port.
    pub(crate) fn client(lp: EventLoop, on_datagram: DatagramCallback) -> io::Result<Self> {
        let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        Self::bind(lp, any, on_datagram)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.sock.local_addr() }

    /// Sends one datagram to `peer`. Blocked sends queue the whole
    /// datagram and enable write interest; datagrams are never split.
    pub fn send_to(&mut self, data: &[u8], peer: SocketAddr) -> bool {
        if !self.pending.is_empty() {
            self.pending.push_back((data.to_vec(), peer));
            return true;
        }
        match self.sock.send_to(data, peer) {
            Ok(sent) => {
                debug_assert_eq!(sent, data.len(), "datagram sends are all-or-nothing");
                true
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.pending.push_back((data.to_vec(), peer));
                let _ = self.lp.modify(Interest::read_write(), self.fd(), self.id);
                true
            }
            Err(err) => {
                log::error!(target: "udp", "send to {peer} failed: {err}");
                false
            }
        }
    }

    pub fn queued(&self) -> usize { self.pending.len() }
}

impl Channel for DatagramSocket {
    fn fd(&self) -> RawFd { self.sock.as_raw_fd() }

    fn id(&self) -> ChannelId { self.id }

    fn set_id(&mut self, id: ChannelId) { self.id = id; }

    fn handle_read(&mut self) -> bool {
        let mut buf = mem::take(&mut self.recv_buf);
        let keep = loop {
            match self.sock.recv_from(&mut buf) {
                Ok((bytes, peer)) => {
                    if let Some(cb) = self.on_datagram.take() {
                        cb(self, &buf[..bytes], peer);
                        if self.on_datagram.is_none() {
                            self.on_datagram = Some(cb);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!(target: "udp", "receive failed: {err}");
                    break false;
                }
            }
        };
        self.recv_buf = buf;
        keep
    }

    fn handle_write(&mut self) -> bool {
        while let Some((data, peer)) = self.pending.front() {
            match self.sock.send_to(data, *peer) {
                Ok(sent) => {
                    debug_assert_eq!(sent, cmp::min(data.len(), MAX_DATAGRAM));
                    self.pending.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!(target: "udp", "flush to {peer} failed: {err}");
                    return false;
                }
            }
        }
        let _ = self.lp.modify(Interest::read_only(), self.fd(), self.id);
        true
    }

    fn handle_error(&mut self) {
        log::error!(target: "udp", "error event on datagram socket");
        self.lp.unregister(self.fd(), self.id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
