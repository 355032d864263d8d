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
use std::{io, mem, ptr};

use super::{Interest, IoEvent, Poll};

/// Readiness multiplexer over BSD/Darwin `kqueue(2)`.
pub struct Kqueue {
    kq: RawFd,
    events: Vec<libc::kevent>,
    fired: VecDeque<IoEvent>,
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Kqueue {
            kq,
            events: Vec::new(),
            fired: empty!(),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16, token: u64) -> io::Result<()> {
        // field-wise init: the kevent layout grows extra members on some BSDs
        let mut change: libc::kevent = unsafe { mem::zeroed() };
        change.ident = fd as libc::uintptr_t;
        change.filter = filter;
        change.flags = flags;
        change.udata = token as *mut libc::c_void;
        let ret =
            unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        for (filter, wanted) in
            [(libc::EVFILT_READ, interest.read), (libc::EVFILT_WRITE, interest.write)]
        {
            let result = if wanted {
                self.change(fd, filter, libc::EV_ADD | libc::EV_ENABLE, token)
            } else {
                self.change(fd, filter, libc::EV_DELETE, token)
            };
            match result {
                // deleting a filter that was never armed is a no-op
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) && !wanted => {}
                Err(err) => return Err(err),
                Ok(()) => {}
            }
        }
        Ok(())
    }
}

impl Poll for Kqueue {
    fn register(&mut self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        // EV_ADD re-arms an existing filter, so register and modify coincide
        self.apply(fd, interest, token)
    }

    fn modify(&mut self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        self.apply(fd, interest, token)
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self.apply(fd, Interest::none(), 0) {
            Err(err) if err.raw_os_error() == Some(libc::EBADF) => Ok(()),
            other => other,
        }
    }

    fn poll(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<usize> {
        let max_events = max_events.max(1);
        if self.events.len() < max_events {
            self.events.resize(max_events, unsafe { mem::zeroed() });
        }

        let ts = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);

        let fired = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                max_events as libc::c_int,
                ts_ptr,
            )
        };
        if fired < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted { Ok(0) } else { Err(err) };
        }

        for ev in &self.events[..fired as usize] {
            self.fired.push_back(IoEvent {
                token: ev.udata as u64,
                readable: ev.filter == libc::EVFILT_READ,
                writable: ev.filter == libc::EVFILT_WRITE,
                error: ev.flags & libc::EV_ERROR != 0,
            });
        }
        Ok(fired as usize)
    }
}

impl Iterator for Kqueue {
    type Item = IoEvent;

    fn next(&mut self) -> Option<Self::Item> { self.fired.pop_front() }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
