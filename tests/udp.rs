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

//! UDP datagram channel: whole-datagram echo through a loop-driven socket.

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::datagram::DatagramSocket;
use netloop::EventLoop;

#[test]
fn datagrams_echo_whole_messages() {
    let (addr_tx, addr_rx) = chan::bounded(1);
    let (stop_tx, stop_rx) = chan::bounded::<()>(1);

    let server = thread::spawn(move || {
        let lp = EventLoop::new().expect("event loop for the server thread");
        let bound = lp
            .listen_udp(
                "127.0.0.1:0".parse().expect("literal address"),
                Arc::new(|sock: &mut DatagramSocket, data: &[u8], peer: std::net::SocketAddr| {
                    // datagram echo: one reply per message, never split
                    assert!(sock.send_to(data, peer));
                }),
            )
            .expect("bind an ephemeral datagram socket");
        addr_tx.send((bound, lp.handle())).expect("test waits for the address");
        lp.run();
        stop_tx.send(()).ok();
    });

    let (addr, control) = addr_rx.recv().expect("server boots");

    let client = UdpSocket::bind("127.0.0.1:0").expect("client socket");
    client.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");

    for payload in [&b"ping"[..], &b"a-longer-datagram-payload"[..]] {
        client.send_to(payload, addr).expect("client sends");
        let mut reply = [0u8; 128];
        let (len, from) = client.recv_from(&mut reply).expect("echo arrives");
        assert_eq!(from, addr);
        assert_eq!(&reply[..len], payload, "the datagram comes back whole");
    }

    control.stop();
    stop_rx.recv_timeout(Duration::from_secs(5)).expect("server loop stops");
    server.join().expect("server thread exits");
}
