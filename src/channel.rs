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

//! Channels: the polymorphic I/O sources an event loop dispatches to.

use std::any::Any;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Loop-assigned channel identity; monotonically allocated, never 0 for a
/// live channel.
pub type ChannelId = u64;

/// A kernel I/O source registered with an event loop.
///
/// Read and write hooks return a continue/close decision: `false` routes the
/// channel to [`Channel::handle_error`]. Channels are held by shared
/// ownership — the loop's channel map plus the local strong reference a
/// dispatch step takes across a callback — so a hook may unregister itself
/// or another channel mid-dispatch.
pub trait Channel {
    fn fd(&self) -> RawFd;

    fn id(&self) -> ChannelId;

    fn set_id(&mut self, id: ChannelId);

    fn handle_read(&mut self) -> bool;

    fn handle_write(&mut self) -> bool;

    fn handle_error(&mut self);

    /// Loop-side downcast access for typed cross-thread operations.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The read half of the loop's self-pipe, registered as an ordinary channel.
///
/// Another thread posting work writes one byte through the [`Notifier`] to
/// unblock the multiplexer; multiple pending notifications coalesce in the
/// pipe.
pub(crate) struct WakeChannel {
    pipe: UnixStream,
    id: ChannelId,
}

/// The write half of the loop's self-pipe. Shared across threads through the
/// loop inbox.
pub(crate) struct Notifier {
    pipe: UnixStream,
}

impl Notifier {
    pub(crate) fn notify(&self) {
        // a full pipe already guarantees a pending wake-up
        let _ = (&self.pipe).write(&[1u8]);
    }
}

pub(crate) fn wake_pair() -> io::Result<(WakeChannel, Notifier)> {
    let (read_half, write_half) = UnixStream::pair()?;
    read_half.set_nonblocking(true)?;
    write_half.set_nonblocking(true)?;
    Ok((WakeChannel { pipe: read_half, id: 0 }, Notifier { pipe: write_half }))
}

impl Channel for WakeChannel {
    fn fd(&self) -> RawFd { self.pipe.as_raw_fd() }

    fn id(&self) -> ChannelId { self.id }

    fn set_id(&mut self, id: ChannelId) { self.id = id; }

    fn handle_read(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match (&self.pipe).read(&mut byte) {
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(err) => {
                log::error!(target: "loop", "wake pipe read failed: {err}");
                false
            }
        }
    }

    fn handle_write(&mut self) -> bool {
        debug_assert!(false, "wake channel is never registered for write");
        false
    }

    fn handle_error(&mut self) {
        log::error!(target: "loop", "error event on the wake pipe");
    }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_coalesce_in_the_pipe() {
        let (mut wake, notifier) = wake_pair().expect("socketpair");
        notifier.notify();
        notifier.notify();
        notifier.notify();
        assert!(wake.handle_read());
        assert!(wake.handle_read());
        assert!(wake.handle_read());
        // pipe drained: a spurious readable dispatch stays harmless
        assert!(wake.handle_read());
    }
}
