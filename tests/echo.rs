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

//! End-to-end TCP scenarios against a live application: echo, pipelined
//! response batching, and graceful half-close with a pending send backlog.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::{App, AppHandle, Connection, NewConnCallback, SafeSender};

/// Boots an application with one worker loop in a background thread and
/// returns its ephemeral listen address plus the control handle.
fn serve(on_new_conn: NewConnCallback) -> (SocketAddr, AppHandle, thread::JoinHandle<()>) {
    let (tx, rx) = chan::bounded(1);
    let server = thread::spawn(move || {
        let app = App::new(1).expect("application with one worker");
        let addr = app.listen("loopback", 0, on_new_conn).expect("listen on an ephemeral port");
        tx.send((addr, app.handle())).expect("test waits for the address");
        app.run();
    });
    let (addr, control) = rx.recv().expect("server boots");
    (addr, control, server)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn echo_round_trip_and_single_disconnect() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let observed = disconnects.clone();

    let (addr, control, server) = serve(Arc::new(move |conn: &mut Connection| {
        let observed = observed.clone();
        conn.set_on_message(|conn, data| {
            let len = data.len();
            conn.send(data);
            len
        });
        conn.set_on_disconnect(move |_conn| {
            observed.fetch_add(1, Ordering::SeqCst);
        });
    }));

    let mut client = TcpStream::connect(addr).expect("client connects");
    client.write_all(b"hello").expect("client sends");
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).expect("echo arrives");
    assert_eq!(&reply, b"hello");

    drop(client);
    wait_until("the disconnect hook", || disconnects.load(Ordering::SeqCst) == 1);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1, "disconnect fires exactly once");

    control.stop();
    server.join().expect("server thread exits");
}

#[test]
fn pipelined_responses_flush_as_one_batch() {
    // the handler consumes one byte per call and answers one byte per call;
    // with batching on, all four answers leave in a single send
    let (addr, control, server) = serve(Arc::new(|conn: &mut Connection| {
        conn.set_batch_send(true);
        conn.set_on_message(|conn, data| {
            conn.send(&data[..1]);
            1
        });
    }));

    let mut client = TcpStream::connect(addr).expect("client connects");
    client.write_all(b"ABCD").expect("one pipelined segment");
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).expect("batched responses arrive");
    assert_eq!(&reply, b"ABCD");

    control.stop();
    server.join().expect("server thread exits");
}

#[test]
fn active_close_drains_pending_megabyte_before_fin() {
    const PAYLOAD: usize = 1 << 20;

    let (addr, control, server) = serve(Arc::new(|conn: &mut Connection| {
        conn.set_on_connect(|conn| {
            let payload = vec![0x5au8; PAYLOAD];
            assert!(conn.send(&payload));
            conn.active_close();
        });
    }));

    let mut client = TcpStream::connect(addr).expect("client connects");
    let mut received = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk).expect("drain until FIN") {
            0 => break,
            n => {
                assert!(chunk[..n].iter().all(|byte| *byte == 0x5a));
                received += n;
            }
        }
    }
    assert_eq!(received, PAYLOAD, "every queued byte arrives before the FIN");

    control.stop();
    server.join().expect("server thread exits");
}

#[test]
fn safe_send_reaches_the_connection_from_another_thread() {
    let (sender_tx, sender_rx) = chan::bounded::<SafeSender>(1);

    let (addr, control, server) = serve(Arc::new(move |conn: &mut Connection| {
        sender_tx.send(conn.sender()).expect("hand the sender to the test");
        conn.set_on_message(|_conn, data| data.len());
    }));

    let mut client = TcpStream::connect(addr).expect("client connects");
    let sender = sender_rx.recv().expect("connection established");

    // this thread is not the owning loop: the send re-posts as a task
    sender.send(b"pushed".to_vec());
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).expect("cross-thread payload arrives");
    assert_eq!(&reply, b"pushed");

    control.stop();
    server.join().expect("server thread exits");
}
