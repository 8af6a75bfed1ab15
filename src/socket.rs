//! Socket factory.
//!
//! Four operations, each taking an address string and returning one or more
//! open `std::net` sockets: [`datagram_listener`], [`stream_listener`],
//! [`datagram_client`], [`stream_client`]. Pre-bind socket options
//! (`SO_REUSEADDR`, `IPV6_V6ONLY`, the listen backlog) are set through
//! `socket2` before the socket is converted to its `std` type, so the rest
//! of the crate never has to reach for raw `setsockopt` calls.

use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::info;

use crate::addr::{self, ParsedAddress};

/// Listen backlog used for all stream listeners, matching the original
/// tunnel's fixed value.
const LISTEN_BACKLOG: i32 = 128;

/// Errors produced by the socket factory.
#[derive(Debug, Error)]
pub enum Error {
    /// Address parsing failed.
    #[error(transparent)]
    Addr(#[from] addr::Error),
    /// No candidate address could be bound.
    #[error("cannot bind to {0}")]
    BindFailure(String),
    /// No candidate address could be connected to.
    #[error("cannot connect to {0}")]
    ConnectFailure(String),
    /// Socket creation itself failed for every candidate address.
    #[error("cannot create socket for {0}: {1}")]
    SocketCreation(String, #[source] std::io::Error),
}

/// Create one bound datagram (UDP) listener. Requires a port; binds the
/// first address family that succeeds when no host is given.
pub fn datagram_listener(address: &str) -> Result<UdpSocket, Error> {
    let parsed = addr::parse(address)?;
    let port = parsed.port.ok_or_else(|| addr::Error::MissingPort(address.to_string()))?;

    let candidates = resolve_listener_candidates(&parsed, port)?;
    for candidate in &candidates {
        match bind_datagram(*candidate) {
            Ok(socket) => {
                info!(local = %candidate, "listening for UDP datagrams");
                return Ok(socket);
            }
            Err(_) => continue,
        }
    }
    Err(Error::BindFailure(address.to_string()))
}

fn bind_datagram(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Create one-or-more bound, listening stream (TCP) sockets: all resolved
/// address families when no host is given, every resolved address
/// otherwise. IPv6 sockets disable the dual-stack v4-mapped fallback so an
/// IPv4 listener, if present, owns v4 traffic.
pub fn stream_listener(address: &str) -> Result<Vec<TcpListener>, Error> {
    let parsed = addr::parse(address)?;
    let port = parsed.port.ok_or_else(|| addr::Error::MissingPort(address.to_string()))?;

    let candidates = resolve_listener_candidates(&parsed, port)?;
    let mut listeners = Vec::new();
    for candidate in candidates {
        if let Ok(listener) = bind_stream_listener(candidate) {
            info!(local = %candidate, "listening for TCP connections");
            listeners.push(listener);
        }
    }
    if listeners.is_empty() {
        return Err(Error::BindFailure(address.to_string()));
    }
    Ok(listeners)
}

fn bind_stream_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn resolve_listener_candidates(parsed: &ParsedAddress, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let addrs = match &parsed.host {
        Some(host) => addr::resolve_host_port(host, port)?,
        None => addr::resolve_wildcard(port)?,
    };
    Ok(addrs)
}

/// Create one datagram socket plus a resolved destination address. The
/// socket is not connected: the caller sends explicitly via `send_to`.
/// Requires both host and port.
pub fn datagram_client(address: &str) -> Result<(UdpSocket, SocketAddr), Error> {
    let parsed = addr::parse(address)?;
    let (host, port) = require_host_and_port(&parsed, address)?;
    let candidates = addr::resolve_host_port(&host, port)?;

    for candidate in candidates {
        let domain = Domain::for_address(candidate);
        let local: SocketAddr = if candidate.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = match Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if socket.bind(&local.into()).is_err() {
            continue;
        }
        info!(destination = %candidate, "UDP destination resolved");
        return Ok((socket.into(), candidate));
    }
    Err(Error::SocketCreation(
        address.to_string(),
        std::io::Error::new(std::io::ErrorKind::Other, "no usable address family"),
    ))
}

/// Create one connected stream socket, trying each resolved address in
/// order until one succeeds. Requires both host and port.
pub fn stream_client(address: &str) -> Result<TcpStream, Error> {
    let parsed = addr::parse(address)?;
    let (host, port) = require_host_and_port(&parsed, address)?;
    let candidates = addr::resolve_host_port(&host, port)?;

    for candidate in &candidates {
        match TcpStream::connect(candidate) {
            Ok(stream) => {
                info!(remote = %candidate, "TCP connection opened");
                return Ok(stream);
            }
            Err(_) => continue,
        }
    }
    Err(Error::ConnectFailure(address.to_string()))
}

fn require_host_and_port(parsed: &ParsedAddress, original: &str) -> Result<(String, u16), Error> {
    match (&parsed.host, parsed.port) {
        (Some(h), Some(p)) => Ok((h.clone(), p)),
        _ => Err(addr::Error::MissingAddressOrPort(original.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::io::Write;

    #[test]
    fn datagram_listener_binds_ephemeral_port() {
        let sock = datagram_listener("127.0.0.1:0").unwrap();
        assert!(sock.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn stream_listener_binds_and_accepts() {
        let listeners = stream_listener("127.0.0.1:0").unwrap();
        assert_eq!(listeners.len(), 1);
        let addr = listeners[0].local_addr().unwrap();
        let listener = listeners.into_iter().next().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn stream_client_requires_host_and_port() {
        let err = stream_client("8080").unwrap_err();
        assert!(matches!(err, Error::Addr(addr::Error::MissingAddressOrPort(_))));
    }

    #[test]
    fn datagram_listener_requires_port() {
        let err = datagram_listener("localhost").unwrap_err();
        assert!(matches!(err, Error::Addr(addr::Error::MissingPort(_))));
    }
}
