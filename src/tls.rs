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

//! TLS byte-stream filter over a [`Connection`].
//!
//! The filter sits between kernel I/O and the user's message handler: it
//! installs itself as the connection's `on_message`, feeds arriving
//! ciphertext into the TLS engine, pumps outbound ciphertext back through
//! the connection, and delivers decrypted bytes to the user handler with
//! the same consumed-count contract plain connections use. User writes
//! issued while the engine is still handshaking are buffered and flushed on
//! completion.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::{fmt, mem};

use rustls::client::Resumption;
use rustls::server::NoServerSessionStorage;
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerConnection, ServerName,
};

use crate::buffer::Buffer;
use crate::connection::Connection;

/// Plaintext drained from the engine per pass.
const PLAIN_CHUNK: usize = 16 * 1024;

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum TlsError {
    /// I/O error: {0}
    #[from]
    Io(io::Error),

    /// TLS engine error: {0}
    #[from]
    Tls(rustls::Error),

    /// no certificate found in {0}
    NoCertificate(String),

    /// no private key found in {0}
    NoPrivateKey(String),

    /// invalid server name `{0}`
    BadServerName(String),
}

/// Server-side engine configuration from PEM cert/key paths.
///
/// SSLv2/SSLv3 are unrepresentable in the engine; the session cache is
/// disabled.
pub fn server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.session_storage = Arc::new(NoServerSessionStorage {});
    Ok(Arc::new(config))
}

/// Client-side engine configuration trusting the CAs in `ca` (PEM).
/// Session resumption is disabled.
pub fn client_config(ca: &Path) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(&cert)?;
    }
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.resumption = Resumption::disabled();
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.display().to_string()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Plaintext handler behind the filter: same consumed-count contract as
/// [`Connection::set_on_message`], with the filter itself passed in so the
/// handler can respond through [`TlsFilter::send`].
pub type TlsMessageCallback = Box<dyn FnMut(&mut TlsFilter, &mut Connection, &[u8]) -> usize>;

/// The byte-stream transform plugged between a connection's kernel I/O and
/// the user's message handler.
pub struct TlsFilter {
    engine: rustls::Connection,
    plain_in: Buffer,
    plain_out: Buffer,
    on_message: Option<TlsMessageCallback>,
    on_established: Option<Box<dyn FnOnce(&mut TlsFilter, &mut Connection)>>,
    established: bool,
}

impl fmt::Debug for TlsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsFilter").field("established", &self.established).finish_non_exhaustive()
    }
}

impl TlsFilter {
    /// Installs a server-side filter onto `conn`.
    pub fn server(
        conn: &mut Connection,
        config: Arc<ServerConfig>,
        on_message: impl FnMut(&mut TlsFilter, &mut Connection, &[u8]) -> usize + 'static,
    ) -> Result<Rc<RefCell<TlsFilter>>, TlsError> {
        let engine = rustls::Connection::Server(ServerConnection::new(config)?);
        Ok(Self::attach(conn, engine, Box::new(on_message)))
    }

    /// Installs a client-side filter onto `conn` and sends the first
    /// handshake flight.
    pub fn client(
        conn: &mut Connection,
        config: Arc<ClientConfig>,
        server_name: &str,
        on_message: impl FnMut(&mut TlsFilter, &mut Connection, &[u8]) -> usize + 'static,
    ) -> Result<Rc<RefCell<TlsFilter>>, TlsError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| TlsError::BadServerName(server_name.to_string()))?;
        let engine = rustls::Connection::Client(ClientConnection::new(config, name)?);
        Ok(Self::attach(conn, engine, Box::new(on_message)))
    }

    fn attach(
        conn: &mut Connection,
        engine: rustls::Connection,
        on_message: TlsMessageCallback,
    ) -> Rc<RefCell<TlsFilter>> {
        let filter = Rc::new(RefCell::new(TlsFilter {
            engine,
            plain_in: Buffer::new(),
            plain_out: Buffer::new(),
            on_message: Some(on_message),
            on_established: None,
            established: false,
        }));

        let hook = filter.clone();
        conn.set_on_message(move |conn, data| hook.borrow_mut().on_ciphertext(conn, data));
        // client engines have a first flight ready before any input
        filter.borrow_mut().flush_ciphertext(conn);
        filter
    }

    /// Hook run once the handshake completes, before buffered writes flush.
    pub fn set_on_established(
        &mut self,
        cb: impl FnOnce(&mut TlsFilter, &mut Connection) + 'static,
    ) {
        self.on_established = Some(Box::new(cb));
    }

    pub fn is_established(&self) -> bool { self.established }

    /// Encrypts and sends plaintext. While the engine is handshaking the
    /// bytes are buffered and flushed on completion.
    pub fn send(&mut self, conn: &mut Connection, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        if self.engine.is_handshaking() {
            self.plain_out.push(data);
            return true;
        }
        if let Err(err) = self.engine.writer().write_all(data) {
            log::error!(target: "tls", "plaintext write failed: {err}");
            return false;
        }
        self.flush_ciphertext(conn);
        true
    }

    /// Sends the bidirectional close-notify and closes the connection.
    pub fn shutdown(&mut self, conn: &mut Connection) {
        self.engine.send_close_notify();
        self.flush_ciphertext(conn);
        conn.active_close();
    }

    /// The connection-level message handler: ciphertext in, plaintext out.
    fn on_ciphertext(&mut self, conn: &mut Connection, data: &[u8]) -> usize {
        let mut rest = data;
        while !rest.is_empty() {
            match self.engine.read_tls(&mut rest) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    log::error!(target: "tls", "ciphertext ingest failed: {err}");
                    conn.active_close();
                    return data.len();
                }
            }

            if let Err(err) = self.engine.process_new_packets() {
                log::error!(target: "tls", "TLS protocol error: {err}");
                // flush the alert the engine queued, then drop the link
                self.flush_ciphertext(conn);
                conn.active_close();
                return data.len();
            }

            if !self.drain_plaintext(conn) {
                return data.len();
            }
        }

        if !self.established && !self.engine.is_handshaking() {
            self.established = true;
            log::debug!(target: "tls", "handshake complete on fd");
            if let Some(cb) = self.on_established.take() {
                cb(self, conn);
            }
            if !self.plain_out.is_empty() {
                let buffered = mem::take(&mut self.plain_out);
                if let Err(err) = self.engine.writer().write_all(buffered.readable()) {
                    log::error!(target: "tls", "buffered plaintext write failed: {err}");
                }
            }
        }

        self.flush_ciphertext(conn);
        self.deliver(conn);
        data.len()
    }

    /// Moves decrypted bytes from the engine into the inbound plaintext
    /// buffer. Returns `false` when the peer closed the stream.
    fn drain_plaintext(&mut self, conn: &mut Connection) -> bool {
        loop {
            self.plain_in.assure_space(PLAIN_CHUNK);
            match self.engine.reader().read(self.plain_in.writable()) {
                // a clean close-notify from the peer
                Ok(0) => {
                    log::debug!(target: "tls", "peer sent close-notify");
                    conn.active_close();
                    return false;
                }
                Ok(bytes) => self.plain_in.produce(bytes),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) => {
                    log::error!(target: "tls", "plaintext read failed: {err}");
                    conn.active_close();
                    return false;
                }
            }
        }
    }

    /// Pumps pending ciphertext out of the engine into the connection.
    fn flush_ciphertext(&mut self, conn: &mut Connection) {
        while self.engine.wants_write() {
            let mut out = Vec::new();
            match self.engine.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => {
                    conn.send(&out);
                }
                Err(err) => {
                    log::error!(target: "tls", "ciphertext flush failed: {err}");
                    break;
                }
            }
        }
    }

    /// Feeds buffered plaintext to the user handler with the consumed-count
    /// contract.
    fn deliver(&mut self, conn: &mut Connection) {
        let mut cb = match self.on_message.take() {
            Some(cb) => cb,
            None => return,
        };
        let mut plain = mem::take(&mut self.plain_in);
        while !plain.is_empty() {
            let consumed = cb(self, conn, plain.readable());
            if consumed == 0 {
                break;
            }
            plain.consume(consumed);
        }
        // new plaintext cannot appear while the handler runs, but keep the
        // merge order right if that ever changes
        if !self.plain_in.is_empty() {
            plain.push(self.plain_in.readable());
        }
        self.plain_in = plain;
        if self.on_message.is_none() {
            self.on_message = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_an_io_error() {
        let missing = Path::new("/nonexistent/server.pem");
        match server_config(missing, missing) {
            Err(TlsError::Io(_)) => {}
            other => panic!("expected an I/O error, got {other:?}"),
        }
    }

    #[test]
    fn empty_pem_reports_no_certificate() {
        let dir = std::env::temp_dir().join("netloop-tls-test");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let empty = dir.join("empty.pem");
        std::fs::write(&empty, "not a pem\n").expect("write");
        match load_certs(&empty) {
            Err(TlsError::NoCertificate(path)) => assert!(path.contains("empty.pem")),
            other => panic!("expected a missing-certificate error, got {other:?}"),
        }
    }
}
