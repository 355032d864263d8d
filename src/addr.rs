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

//! IPv4 address literals: dotted-quad `IP:PORT` with the `loopback` token.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Address token expanding to `127.0.0.1`.
pub const LOOPBACK: &str = "loopback";

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum AddrError {
    /// invalid IPv4 address `{0}`
    InvalidIp(String),

    /// invalid port in `{0}`
    InvalidPort(String),

    /// missing port in `{0}`
    MissingPort(String),
}

/// Builds a socket address from a dotted-quad IP (or [`LOOPBACK`]) and a
/// host-order port.
pub fn socket_addr(ip: &str, port: u16) -> Result<SocketAddr, AddrError> {
    let ip = if ip == LOOPBACK {
        Ipv4Addr::LOCALHOST
    } else {
        ip.parse::<Ipv4Addr>().map_err(|_| AddrError::InvalidIp(ip.to_string()))?
    };
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Parses the CLI literal form `IP:PORT`.
pub fn parse_hostport(literal: &str) -> Result<SocketAddr, AddrError> {
    let (ip, port) = literal.rsplit_once(':').ok_or_else(|| AddrError::MissingPort(literal.to_string()))?;
    let port: u16 = port.parse().map_err(|_| AddrError::InvalidPort(literal.to_string()))?;
    socket_addr(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_token_expands() {
        let addr = socket_addr(LOOPBACK, 6379).expect("loopback literal");
        assert_eq!(addr.to_string(), "127.0.0.1:6379");
    }

    #[test]
    fn hostport_literal_round_trips() {
        let addr = parse_hostport("10.0.0.2:80").expect("dotted quad");
        assert_eq!(addr.to_string(), "10.0.0.2:80");
        assert_eq!(
            parse_hostport("loopback:0").expect("loopback with port").to_string(),
            "127.0.0.1:0"
        );
    }

    #[test]
    fn malformed_literals_are_rejected() {
        assert!(matches!(parse_hostport("127.0.0.1"), Err(AddrError::MissingPort(_))));
        assert!(matches!(parse_hostport("127.0.0.1:78900"), Err(AddrError::InvalidPort(_))));
        assert!(matches!(socket_addr("not-an-ip", 80), Err(AddrError::InvalidIp(_))));
    }
}
