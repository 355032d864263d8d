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

//! Thread-affine event loop binding the readiness multiplexer, the channel
//! set, the timer wheel and a cross-thread task inbox.
//!
//! [`EventLoop`] is the in-thread driver; a [`LoopHandle`] is its cloneable
//! `Send` face, safe to use from any thread. At most one loop exists per OS
//! thread, enforced by a thread-local installed by the constructor.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::{fmt, io};

use crate::acceptor::{Acceptor, LoopSelector};
use crate::channel::{wake_pair, Channel, ChannelId, Notifier};
use crate::connection::NewConnCallback;
use crate::connector::{Connector, FailCallback};
use crate::datagram::{DatagramCallback, DatagramSocket};
use crate::future::{Future, Promise, Scheduler, Task};
use crate::poller::{default_poller, Interest, Poll};
use crate::timer::{TimerId, TimerWheel};

/// Poll timeout bounds: `clamp(nearest timer, 1 ms, 10 ms)`.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(10);
const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = RefCell::new(None);
}

/// Errors surfaced by loop bookkeeping operations.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum LoopError {
    /// channel registered with an empty event mask
    NoInterest,

    /// file descriptor {fd} is at or above the open-files ceiling {limit}
    FdCeiling { fd: RawFd, limit: RawFd },

    /// I/O error: {0}
    #[from]
    Io(io::Error),
}

pub(crate) struct Inbox {
    tasks: Mutex<Vec<Task>>,
    notifier: Notifier,
    stopped: AtomicBool,
}

struct LoopCore {
    id: usize,
    poller: RefCell<Box<dyn Poll>>,
    timers: RefCell<TimerWheel>,
    channels: RefCell<HashMap<ChannelId, Rc<RefCell<dyn Channel>>>>,
    inbox: Arc<Inbox>,
    next_channel_id: Cell<ChannelId>,
    max_fd: RawFd,
}

/// Per-thread reactor driver.
///
/// Cloning is cheap (a shared-core handle for the owning thread); the loop
/// never crosses threads — use [`EventLoop::handle`] for that.
#[derive(Clone)]
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("id", &self.core.id).finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Creates the loop for the current thread and installs it into the
    /// thread-local slot. Constructing a second loop on the same thread is a
    /// programmer error and panics.
    pub fn new() -> io::Result<EventLoop> {
        CURRENT.with(|current| {
            assert!(current.borrow().is_none(), "at most one event loop per thread")
        });

        let (wake, notifier) = wake_pair()?;
        let inbox = Arc::new(Inbox {
            tasks: Mutex::new(Vec::new()),
            notifier,
            stopped: AtomicBool::new(false),
        });
        let lp = EventLoop {
            core: Rc::new(LoopCore {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                poller: RefCell::new(default_poller()?),
                timers: RefCell::new(TimerWheel::new()),
                channels: RefCell::new(empty!()),
                inbox,
                next_channel_id: Cell::new(0),
                max_fd: max_open_files(),
            }),
        };
        CURRENT.with(|current| *current.borrow_mut() = Some(lp.clone()));

        // registered up front so cross-thread submits wake the poll
        lp.register(Interest::read_only(), Rc::new(RefCell::new(wake)))
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        Ok(lp)
    }

    /// The loop owned by the calling thread, if one was constructed there.
    pub fn current() -> Option<EventLoop> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn id(&self) -> usize { self.core.id }

    /// Whether the calling thread runs this loop.
    pub fn in_this_loop(&self) -> bool {
        CURRENT.with(|current| {
            current.borrow().as_ref().map(|lp| lp.core.id) == Some(self.core.id)
        })
    }

    /// The `Send` face of this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { id: self.core.id, inbox: self.core.inbox.clone() }
    }

    /// Registered channel count (the wake channel included).
    pub fn len(&self) -> usize { self.core.channels.borrow().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Registers a channel, assigning its loop-unique id.
    ///
    /// Fails when the descriptor is at or above the `RLIMIT_NOFILE` ceiling.
    /// Re-registering a live channel is a programmer error and panics.
    pub fn register(
        &self,
        interest: Interest,
        channel: Rc<RefCell<dyn Channel>>,
    ) -> Result<ChannelId, LoopError> {
        assert!(self.in_this_loop(), "register must run on the loop thread");
        if interest.is_none() {
            return Err(LoopError::NoInterest);
        }

        let (fd, previous_id) = {
            let channel = channel.borrow();
            (channel.fd(), channel.id())
        };
        assert_eq!(previous_id, 0, "channel {previous_id} is already registered");

        if fd + 1 >= self.core.max_fd {
            log::error!(
                target: "loop",
                "register failed: fd {fd} is at the open-files ceiling {}",
                self.core.max_fd
            );
            return Err(LoopError::FdCeiling { fd, limit: self.core.max_fd });
        }

        let id = self.next_channel_id();
        channel.borrow_mut().set_id(id);
        self.core.poller.borrow_mut().register(fd, interest, id)?;
        self.core.channels.borrow_mut().insert(id, channel);
        log::trace!(target: "loop", "loop {} registered channel {id} (fd {fd})", self.core.id);
        Ok(id)
    }

    /// Updates the multiplexer interest set for a registered channel.
    pub fn modify(&self, interest: Interest, fd: RawFd, id: ChannelId) -> Result<(), LoopError> {
        debug_assert!(self.in_this_loop());
        self.core.poller.borrow_mut().modify(fd, interest, id)?;
        Ok(())
    }

    /// Removes a channel from the multiplexer and the channel map.
    pub fn unregister(&self, fd: RawFd, id: ChannelId) {
        debug_assert!(self.in_this_loop());
        if let Err(err) = self.core.poller.borrow_mut().unregister(fd) {
            log::warn!(target: "loop", "unregister of fd {fd} failed: {err}");
        }
        if self.core.channels.borrow_mut().remove(&id).is_none() {
            log::warn!(target: "loop", "unregister of unknown channel {id}");
        }
    }

    /// Looks up a live channel by id.
    pub fn channel(&self, id: ChannelId) -> Option<Rc<RefCell<dyn Channel>>> {
        self.core.channels.borrow().get(&id).cloned()
    }

    /// Installs a TCP acceptor on `addr`; accepted connections are brought
    /// up on this loop. Returns the bound address (ephemeral ports resolve).
    pub fn listen(
        &self,
        addr: SocketAddr,
        on_new_conn: NewConnCallback,
    ) -> Result<SocketAddr, LoopError> {
        let handle = self.handle();
        self.listen_with(addr, Arc::new(move || handle.clone()), on_new_conn)
    }

    /// Installs a TCP acceptor that distributes accepted connections over
    /// the loops produced by `selector`.
    pub fn listen_with(
        &self,
        addr: SocketAddr,
        selector: LoopSelector,
        on_new_conn: NewConnCallback,
    ) -> Result<SocketAddr, LoopError> {
        assert!(self.in_this_loop(), "listen must run on the loop thread");
        let acceptor = Acceptor::bind(self.clone(), addr, selector, on_new_conn)?;
        let local = acceptor.local_addr();
        self.register(Interest::read_only(), Rc::new(RefCell::new(acceptor)))?;
        Ok(local)
    }

    /// Installs a UDP datagram channel bound to `addr`.
    pub fn listen_udp(
        &self,
        addr: SocketAddr,
        on_datagram: DatagramCallback,
    ) -> Result<SocketAddr, LoopError> {
        assert!(self.in_this_loop(), "listen_udp must run on the loop thread");
        let socket = DatagramSocket::bind(self.clone(), addr, on_datagram)?;
        let local = socket.local_addr()?;
        self.register(Interest::read_only(), Rc::new(RefCell::new(socket)))?;
        Ok(local)
    }

    /// Creates an unbound (client-side) UDP datagram channel and returns it
    /// for sending; replies arrive through `on_datagram`.
    pub fn udp_client(
        &self,
        on_datagram: DatagramCallback,
    ) -> Result<Rc<RefCell<DatagramSocket>>, LoopError> {
        assert!(self.in_this_loop(), "udp_client must run on the loop thread");
        let socket = Rc::new(RefCell::new(DatagramSocket::client(self.clone(), on_datagram)?));
        self.register(Interest::read_only(), socket.clone())?;
        Ok(socket)
    }

    /// Starts a non-blocking connect towards `addr` with an optional
    /// timeout. On success the connection is brought up on `dst_loop` (this
    /// loop when `None`) and `on_new_conn` runs there; on timeout or socket
    /// error `on_fail` runs instead. The two outcomes are mutually
    /// exclusive.
    pub fn connect(
        &self,
        addr: SocketAddr,
        on_new_conn: NewConnCallback,
        on_fail: FailCallback,
        timeout: Option<Duration>,
        dst_loop: Option<LoopHandle>,
    ) -> Result<(), LoopError> {
        assert!(self.in_this_loop(), "connect must run on the loop thread");
        Connector::start(self, addr, on_new_conn, on_fail, timeout, dst_loop)
    }

    /// Schedules `f` for the next timer pass of this loop. Loop-thread only;
    /// use [`LoopHandle::execute`] from other threads.
    pub fn schedule(&self, f: impl FnOnce() + 'static) -> TimerId {
        self.schedule_after(Duration::ZERO, f)
    }

    /// Schedules a one-shot timer. Loop-thread only.
    pub fn schedule_after(&self, delay: Duration, f: impl FnOnce() + 'static) -> TimerId {
        assert!(self.in_this_loop(), "timers belong to the loop thread");
        self.core.timers.borrow_mut().schedule_after(delay, once(f))
    }

    /// Schedules a one-shot timer at an absolute deadline. Loop-thread only.
    pub fn schedule_at(&self, deadline: Instant, f: impl FnOnce() + 'static) -> TimerId {
        assert!(self.in_this_loop(), "timers belong to the loop thread");
        self.core.timers.borrow_mut().schedule_at(deadline, once(f))
    }

    /// Schedules a repeating timer (`count` fires, or [`crate::timer::FOREVER`]).
    /// Loop-thread only.
    pub fn schedule_after_with_repeat(
        &self,
        delay: Duration,
        period: Duration,
        count: i64,
        f: impl FnMut() + 'static,
    ) -> TimerId {
        assert!(self.in_this_loop(), "timers belong to the loop thread");
        self.core.timers.borrow_mut().schedule_after_with_repeat(delay, period, count, f)
    }

    /// Cancels a timer lazily. Loop-thread only.
    pub fn cancel(&self, id: TimerId) -> bool {
        assert!(self.in_this_loop(), "timers belong to the loop thread");
        self.core.timers.borrow_mut().cancel(id)
    }

    /// Thread-safe submit; see [`LoopHandle::execute`].
    pub fn execute<F, T>(&self, f: F) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle().execute(f)
    }

    /// Runs the loop until stopped, then unregisters every channel.
    pub fn run(&self) {
        assert!(self.in_this_loop(), "run must be called on the loop thread");
        log::debug!(target: "loop", "loop {} entering its run cycle", self.core.id);

        while !self.core.inbox.stopped.load(Ordering::Acquire) {
            self.turn();
        }

        log::debug!(target: "loop", "loop {} stopped", self.core.id);
        let channels: Vec<_> = {
            let mut map = self.core.channels.borrow_mut();
            map.drain().collect()
        };
        for (_, channel) in channels {
            let fd = channel.borrow().fd();
            let _ = self.core.poller.borrow_mut().unregister(fd);
        }
    }

    /// One loop iteration: poll, dispatch I/O, fire timers, drain the inbox.
    fn turn(&self) {
        let timeout = self
            .core
            .timers
            .borrow()
            .nearest()
            .unwrap_or(MAX_POLL_TIMEOUT)
            .clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT);

        let fired = {
            let mut poller = self.core.poller.borrow_mut();
            let max_events = self.core.channels.borrow().len();
            match poller.poll(max_events, Some(timeout)) {
                Ok(count) => {
                    let mut events = Vec::with_capacity(count);
                    while let Some(event) = poller.next() {
                        events.push(event);
                    }
                    events
                }
                Err(err) => {
                    log::error!(target: "loop", "poll failed: {err}");
                    Vec::new()
                }
            }
        };

        for event in fired {
            // the strong reference keeps the channel alive across hooks even
            // if one of them unregisters it
            let channel = {
                let channels = self.core.channels.borrow();
                match channels.get(&event.token) {
                    Some(channel) => channel.clone(),
                    // stale event: an earlier hook removed this channel
                    None => continue,
                }
            };
            if event.error {
                channel.borrow_mut().handle_error();
                continue;
            }
            if event.readable && !channel.borrow_mut().handle_read() {
                channel.borrow_mut().handle_error();
                continue;
            }
            if event.writable && !channel.borrow_mut().handle_write() {
                channel.borrow_mut().handle_error();
            }
        }

        let now = Instant::now();
        loop {
            let due = self.core.timers.borrow_mut().pop_due(now);
            match due {
                None => break,
                Some((id, mut entry)) => {
                    (entry.callback)();
                    self.core.timers.borrow_mut().finish_fire(id, entry);
                }
            }
        }

        let tasks = {
            let mut pending = self.core.inbox.tasks.lock().expect("loop inbox poisoned");
            mem::take(&mut *pending)
        };
        // tasks scheduled while draining land in the next iteration
        for task in tasks {
            task();
        }
    }

    fn next_channel_id(&self) -> ChannelId {
        let mut id = self.core.next_channel_id.get().wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        self.core.next_channel_id.set(id);
        id
    }
}

/// Cloneable, `Send` face of an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    id: usize,
    inbox: Arc<Inbox>,
}

impl LoopHandle {
    pub fn id(&self) -> usize { self.id }

    /// Whether the calling thread runs the loop behind this handle.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.borrow().as_ref().map(|lp| lp.core.id) == Some(self.id))
    }

    /// Appends a task to the loop inbox and wakes the poll. FIFO per
    /// producer.
    pub fn post(&self, task: Task) {
        self.inbox.tasks.lock().expect("loop inbox poisoned").push(task);
        self.inbox.notifier.notify();
    }

    /// Submits work to the loop, returning a future for its result.
    ///
    /// Called on the loop's own thread, `f` runs inline and the future is
    /// already complete on return; from any other thread the work is posted
    /// to the inbox and the wake channel unblocks the poll. Either way `f`
    /// runs exactly once.
    pub fn execute<F, T>(&self, f: F) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        if self.is_current() {
            promise.set_value(f());
        } else {
            self.post(Box::new(move || {
                promise.set_value(f());
            }));
        }
        future
    }

    /// Thread-safe one-shot timer: schedules `f` on the loop after `delay`.
    pub fn schedule_later(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            EventLoop::current().expect("current checked above").schedule_after(delay, f);
        } else {
            self.post(Box::new(move || {
                EventLoop::current()
                    .expect("inbox tasks run on the loop thread")
                    .schedule_after(delay, f);
            }));
        }
    }

    /// Requests the loop to stop after the current iteration.
    pub fn stop(&self) {
        self.inbox.stopped.store(true, Ordering::Release);
        self.inbox.notifier.notify();
    }

    pub fn is_stopped(&self) -> bool { self.inbox.stopped.load(Ordering::Acquire) }
}

impl Scheduler for LoopHandle {
    fn schedule(&self, task: Task) {
        if self.is_current() {
            task();
        } else {
            self.post(task);
        }
    }
}

fn once(f: impl FnOnce() + 'static) -> impl FnMut() + 'static {
    let mut f = Some(f);
    move || {
        if let Some(f) = f.take() {
            f();
        }
    }
}

fn max_open_files() -> RawFd {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur.min(i32::MAX as libc::rlim_t) as RawFd
    } else {
        1024
    }
}
