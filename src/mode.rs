//! Mode driver.
//!
//! [`run_server`] and [`run_client`] implement the two startup modes named
//! by the CLI's `--server` flag, wiring together the socket factory,
//! supervisor integration, acceptor, and relay engine. Both functions
//! return the [`relay::Termination`] the worker ended with; every variant
//! of it is a clean (exit `0`) shutdown, so callers never need to inspect
//! which one occurred beyond logging it.

use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::time::Duration;

use tracing::info;

use crate::codec::HANDSHAKE_LEN;
use crate::error::Error;
use crate::relay::{Relay, Termination};
use crate::{acceptor, socket, supervisor};

/// The fixed 32-byte handshake token the server validates and the client
/// sends first. Carried over verbatim from the original program: an
/// ASCII signature padded with a short binary tail, not a secret, just a
/// protocol fingerprint that rejects obviously-wrong peers.
pub const DEFAULT_HANDSHAKE: [u8; HANDSHAKE_LEN] = [
    b'u', b'd', b'p', b't', b'u', b'n', b'n', b'e', b'l', b' ', b'b', b'y', b' ', b'm', b'd', b'.',
    0x00, 0x00, 0x00, 0x01, 0x03, 0x06, 0x10, 0x15, 0x21, 0x28, 0x36, 0x45, 0x55, 0x66, 0x78, 0x91,
];

/// Parameters for [`run_server`].
pub struct ServerConfig {
    /// Stream listener address, when not supervisor- or inetd-provided.
    pub listen_addr: Option<String>,
    /// Datagram destination the relay forwards decoded frames to.
    pub egress_addr: String,
    pub inetd: bool,
    pub stream_timeout: Option<Duration>,
    pub handshake: [u8; HANDSHAKE_LEN],
}

/// Parameters for [`run_client`].
pub struct ClientConfig {
    /// Datagram listener address, when not supervisor- or inetd-provided.
    pub listen_addr: Option<String>,
    /// Stream destination (the tunnel server) the relay connects to.
    pub egress_addr: String,
    pub inetd: bool,
    pub datagram_timeout: Option<Duration>,
    pub handshake: [u8; HANDSHAKE_LEN],
}

/// Server mode: stream-ingress, datagram-egress. Installs the worker
/// reaper, obtains a stream connection (from a freshly forked worker, an
/// inherited supervisor socket, or fd 0 under inetd), opens the datagram
/// egress socket, and relays with a handshake expected from the peer.
pub fn run_server(cfg: ServerConfig) -> Result<Termination, Error> {
    acceptor::install_sigchld_reaper()?;

    let stream: TcpStream = if cfg.inetd {
        supervisor::inetd_stream()
    } else if let Some(n) = supervisor::listen_fds() {
        let listeners = supervisor::adopt_stream_listeners(n)?;
        let (stream, peer) = acceptor::accept_connections(listeners)?;
        info!(remote = %peer, "accepted a supervisor-activated connection");
        stream
    } else {
        let address = cfg
            .listen_addr
            .expect("standalone server mode always has a listen address");
        let listeners = socket::stream_listener(&address)?;
        let (stream, peer) = acceptor::accept_connections(listeners)?;
        info!(remote = %peer, "accepted a connection");
        stream
    };

    let (datagram, destination) = socket::datagram_client(&cfg.egress_addr)?;

    let mut relay = Relay::new(
        stream,
        datagram,
        Some(destination),
        true,
        cfg.handshake,
        cfg.stream_timeout,
        None,
    );
    Ok(relay.run()?)
}

/// Client mode: datagram-ingress, stream-egress. Obtains the datagram
/// listener, connects to the tunnel server, sends the handshake once
/// ahead of any frame, and relays without expecting one back.
pub fn run_client(cfg: ClientConfig) -> Result<Termination, Error> {
    let datagram: UdpSocket = if cfg.inetd {
        supervisor::inetd_datagram()
    } else if let Some(n) = supervisor::listen_fds() {
        supervisor::adopt_datagram_listener(n)?
    } else {
        let address = cfg
            .listen_addr
            .expect("standalone client mode always has a listen address");
        socket::datagram_listener(&address)?
    };

    let mut stream = socket::stream_client(&cfg.egress_addr)?;
    stream
        .write_all(&cfg.handshake)
        .map_err(|e| Error::Relay(crate::relay::Error::StreamWrite(e)))?;

    let mut relay = Relay::new(
        stream,
        datagram,
        None,
        false,
        cfg.handshake,
        None,
        cfg.datagram_timeout,
    );
    Ok(relay.run()?)
}
