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

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, ptr};

use super::{timeout_millis, Interest, IoEvent, Poll};

/// Readiness multiplexer over Linux `epoll(7)`, level-triggered.
pub struct Epoll {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    fired: VecDeque<IoEvent>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll {
            epfd,
            events: Vec::new(),
            fired: empty!(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask(interest),
            u64: token,
        };
        let arg = if op == libc::EPOLL_CTL_DEL { ptr::null_mut() } else { &mut ev };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, arg) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn mask(interest: Interest) -> u32 {
    let mut events = 0;
    if interest.read {
        events |= libc::EPOLLIN as u32;
    }
    if interest.write {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

impl Poll for Epoll {
    fn register(&mut self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token) {
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                self.modify(fd, interest, token)
            }
            other => other,
        }
    }

    fn modify(&mut self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        if interest.is_none() {
            return self.unregister(fd);
        }
        match self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
            }
            other => other,
        }
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::none(), 0) {
            // already gone: the caller may close the fd before unregistering
            Err(err)
                if err.raw_os_error() == Some(libc::ENOENT)
                    || err.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn poll(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<usize> {
        let max_events = max_events.max(1);
        if self.events.len() < max_events {
            self.events.resize(max_events, libc::epoll_event { events: 0, u64: 0 });
        }

        let fired = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                max_events as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if fired < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted { Ok(0) } else { Err(err) };
        }

        for ev in &self.events[..fired as usize] {
            self.fired.push_back(IoEvent {
                token: ev.u64,
                readable: ev.events & libc::EPOLLIN as u32 != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                error: ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
        }
        Ok(fired as usize)
    }
}

impl Iterator for Epoll {
    type Item = IoEvent;

    fn next(&mut self) -> Option<Self::Item> { self.fired.pop_front() }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
