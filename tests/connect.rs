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

//! Connector paths: promotion to a live connection on success, and the
//! failure callback on refusal — the two outcomes are mutually exclusive.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::{App, Connection, EventLoop, LoopHandle};

fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = chan::bounded(1);
    let thread = thread::spawn(move || {
        let lp = EventLoop::new().expect("event loop for the test thread");
        tx.send(lp.handle()).expect("test waits for the handle");
        lp.run();
    });
    (rx.recv().expect("loop boots"), thread)
}

#[test]
fn outbound_connect_promotes_to_a_connection() {
    // echo server to dial into
    let (srv_tx, srv_rx) = chan::bounded(1);
    let server = thread::spawn(move || {
        let app = App::new(1).expect("server application");
        let addr = app
            .listen(
                "loopback",
                0,
                Arc::new(|conn: &mut Connection| {
                    conn.set_on_message(|conn, data| {
                        let len = data.len();
                        conn.send(data);
                        len
                    });
                }),
            )
            .expect("server listens");
        srv_tx.send((addr, app.handle())).expect("test waits");
        app.run();
    });
    let (addr, server_control) = srv_rx.recv().expect("server boots");

    let (lh, loop_thread) = spawn_loop();
    let (event_tx, event_rx) = chan::bounded::<Vec<u8>>(4);

    lh.execute(move || {
        let lp = EventLoop::current().expect("running on the loop thread");
        let replies = event_tx.clone();
        lp.connect(
            addr,
            Arc::new(move |conn: &mut Connection| {
                let replies = replies.clone();
                conn.set_on_message(move |_conn, data| {
                    replies.send(data.to_vec()).expect("test is listening");
                    data.len()
                });
                conn.send(b"ping");
            }),
            Box::new(|addr, err| panic!("connect to {addr} failed: {err}")),
            Some(Duration::from_secs(5)),
            None,
        )
        .expect("connect starts");
    })
    .get()
    .expect("connect scheduled");

    let reply = event_rx.recv_timeout(Duration::from_secs(5)).expect("echo comes back");
    assert_eq!(reply, b"ping");

    lh.stop();
    loop_thread.join().expect("client loop exits");
    server_control.stop();
    server.join().expect("server exits");
}

#[test]
fn refused_connect_reports_failure_not_success() {
    // learn a locally free port, then close it again
    let probe = TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let dead_addr = probe.local_addr().expect("probe addr");
    drop(probe);

    let (lh, loop_thread) = spawn_loop();
    let (fail_tx, fail_rx) = chan::bounded(1);

    lh.execute(move || {
        let lp = EventLoop::current().expect("running on the loop thread");
        lp.connect(
            dead_addr,
            Arc::new(|_conn: &mut Connection| {
                panic!("a refused connect must never produce a connection")
            }),
            Box::new(move |_addr, err| {
                fail_tx.send(err).expect("test is listening");
            }),
            Some(Duration::from_secs(2)),
            None,
        )
        .expect("connect starts");
    })
    .get()
    .expect("connect scheduled");

    let err = fail_rx.recv_timeout(Duration::from_secs(5)).expect("failure surfaces");
    // refusal or (on exotic stacks) the guard timer — but never success
    assert!(!err.to_string().is_empty());

    lh.stop();
    loop_thread.join().expect("client loop exits");
}
