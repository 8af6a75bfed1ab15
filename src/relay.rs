//! The relay engine.
//!
//! [`Relay::run`] multiplexes exactly one datagram socket and one stream
//! socket with `nix::poll` (a level-triggered `select`-equivalent),
//! enforcing the optional per-direction idle timeouts and the tolerant
//! handling of a transiently-absent datagram peer. It is deliberately
//! single-threaded and blocking: every socket operation performed after a
//! readiness notification is exactly one syscall, so neither direction can
//! starve the other for longer than that.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{self, Decoder, Frame, HANDSHAKE_LEN};

/// How often the multiplexer wait wakes up on its own when at least one
/// idle timeout is configured, so deadlines are checked promptly even with
/// no traffic on either socket.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Errors that terminate a relay with a non-zero exit.
#[derive(Debug, Error)]
pub enum Error {
    /// The readiness multiplexer failed for a reason other than a signal
    /// interruption.
    #[error("poll failed: {0}")]
    Poll(#[source] Errno),
    /// Reading from the stream socket failed.
    #[error("read(stream) failed: {0}")]
    StreamRead(#[source] std::io::Error),
    /// Writing to the stream socket failed.
    #[error("write(stream) failed: {0}")]
    StreamWrite(#[source] std::io::Error),
    /// Receiving from the datagram socket failed.
    #[error("recv(datagram) failed: {0}")]
    DatagramRecv(#[source] std::io::Error),
    /// A frame could not be encoded (oversized payload can't occur from a
    /// real datagram socket, but a malformed decode is still a bug worth
    /// surfacing).
    #[error(transparent)]
    Codec(#[from] codec::Error),
}

/// Which inbound direction hit its idle deadline, or why the relay ended
/// cleanly. All three variants map to exit code `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The stream peer shut down (a zero-byte read).
    StreamClosed,
    /// The datagram-input idle deadline elapsed.
    DatagramIdleTimeout,
    /// The stream-input idle deadline elapsed.
    StreamIdleTimeout,
    /// The peer's handshake did not match the expected token.
    HandshakeRejected,
}

/// A single live tunnel end: one datagram socket, one stream socket, and
/// the parse state connecting them.
pub struct Relay {
    stream: TcpStream,
    datagram: UdpSocket,
    peer_addr: Option<SocketAddr>,
    decoder: Decoder,
    stream_timeout: Option<Duration>,
    datagram_timeout: Option<Duration>,
    last_stream_activity: Instant,
    last_datagram_activity: Instant,
}

impl Relay {
    /// Build a relay. `peer_addr` seeds the destination used for the first
    /// datagram send (server mode pre-configures it; client mode leaves it
    /// `None` until an inbound datagram arrives). `expect_handshake`
    /// selects the stream parser's initial state.
    #[must_use]
    pub fn new(
        stream: TcpStream,
        datagram: UdpSocket,
        peer_addr: Option<SocketAddr>,
        expect_handshake: bool,
        handshake: [u8; HANDSHAKE_LEN],
        stream_timeout: Option<Duration>,
        datagram_timeout: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            stream,
            datagram,
            peer_addr,
            decoder: Decoder::new(expect_handshake, handshake),
            stream_timeout,
            datagram_timeout,
            last_stream_activity: now,
            last_datagram_activity: now,
        }
    }

    /// Run the relay until the stream closes cleanly, an idle deadline
    /// expires, the handshake is rejected, or a fatal I/O error occurs.
    pub fn run(&mut self) -> Result<Termination, Error> {
        let any_timeout = self.stream_timeout.is_some() || self.datagram_timeout.is_some();

        loop {
            // Borrowed fresh each iteration: held only long enough to poll
            // and read back revents, so the exclusive borrows taken by
            // handle_stream_readable/handle_datagram_readable below don't
            // conflict with it.
            let stream_fd = self.stream.as_fd();
            let datagram_fd = self.datagram.as_fd();
            let mut fds = [
                PollFd::new(stream_fd, PollFlags::POLLIN),
                PollFd::new(datagram_fd, PollFlags::POLLIN),
            ];
            let timeout = if any_timeout {
                PollTimeout::try_from(TIMEOUT_POLL_INTERVAL).expect("10s fits in poll timeout")
            } else {
                PollTimeout::NONE
            };

            let ready = match poll(&mut fds, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Poll(e)),
            };

            if ready == 0 {
                if let Some(timeout) = self.stream_timeout {
                    if self.last_stream_activity.elapsed() > timeout {
                        info!(?timeout, "exiting after idle timeout for stream input");
                        return Ok(Termination::StreamIdleTimeout);
                    }
                }
                if let Some(timeout) = self.datagram_timeout {
                    if self.last_datagram_activity.elapsed() > timeout {
                        info!(?timeout, "exiting after idle timeout for datagram input");
                        return Ok(Termination::DatagramIdleTimeout);
                    }
                }
                continue;
            }

            let stream_ready = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let datagram_ready = fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));

            if stream_ready {
                match self.handle_stream_readable()? {
                    Some(termination) => return Ok(termination),
                    None => {
                        if self.stream_timeout.is_some() {
                            self.last_stream_activity = Instant::now();
                        }
                    }
                }
            }

            if datagram_ready {
                self.handle_datagram_readable()?;
                if self.datagram_timeout.is_some() {
                    self.last_datagram_activity = Instant::now();
                }
            }
        }
    }

    /// One read from the stream socket, followed by decoding and
    /// forwarding as many frames as it yields. Returns `Some(termination)`
    /// if the relay should stop.
    fn handle_stream_readable(&mut self) -> Result<Option<Termination>, Error> {
        let buf = self.decoder.writable();
        let n = match self.stream.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(Error::StreamRead(e)),
        };
        if n == 0 {
            info!("remote closed the connection");
            return Ok(Some(Termination::StreamClosed));
        }
        self.decoder.commit(n);

        let Self {
            decoder,
            datagram,
            peer_addr,
            ..
        } = self;
        let result = decoder.decode(|payload| {
            send_datagram(datagram, *peer_addr, payload).map_err(codec::Error::Forward)
        });
        match result {
            Ok(()) => Ok(None),
            Err(codec::Error::HandshakeRejected) => {
                info!("received a bad handshake, exiting");
                Ok(Some(Termination::HandshakeRejected))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One receive from the datagram socket, updating `peer_addr` and
    /// forwarding a non-empty payload as a single framed stream write.
    fn handle_datagram_readable(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; codec::MAX_PAYLOAD_LEN];
        let (n, src) = match self.datagram.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::DatagramRecv(e)),
        };
        self.peer_addr = Some(src);

        if n == 0 {
            debug!(source = %src, "dropping zero-length datagram");
            return Ok(());
        }

        let mut framed = Vec::with_capacity(2 + n);
        Frame::encode(&buf[..n], &mut framed)?;
        self.stream
            .write_all(&framed)
            .map_err(Error::StreamWrite)?;
        Ok(())
    }
}

/// Send `payload` to `peer_addr`, tolerating a transiently-refused
/// destination: `ConnectionRefused` is logged and swallowed rather than
/// propagated, since the datagram peer may simply not be listening yet.
fn send_datagram(
    socket: &UdpSocket,
    peer_addr: Option<SocketAddr>,
    payload: &[u8],
) -> std::io::Result<()> {
    let Some(addr) = peer_addr else {
        info!("ignoring a packet for a still unknown UDP destination");
        return Ok(());
    };
    match socket.send_to(payload, addr) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            info!("sendto(udp) returned ConnectionRefused: ignored");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const TOKEN: [u8; HANDSHAKE_LEN] = [7u8; HANDSHAKE_LEN];

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn forwards_datagram_as_frame_on_stream() {
        let (client_stream, mut server_stream) = loopback_pair();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let relay_addr = relay_udp.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut relay = Relay::new(client_stream, relay_udp, None, false, TOKEN, None, None);
        sender.send_to(b"ping", relay_addr).unwrap();
        relay.handle_datagram_readable().unwrap();
        assert_eq!(relay.peer_addr, Some(sender.local_addr().unwrap()));

        let mut framed = Vec::new();
        Frame::encode(b"ping", &mut framed).unwrap();
        let mut got = vec![0u8; framed.len()];
        server_stream.read_exact(&mut got).unwrap();
        assert_eq!(got, framed);
    }

    #[test]
    fn forwards_stream_frame_to_datagram() {
        let (client_stream, mut server_stream) = loopback_pair();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink_addr = sink_udp.local_addr().unwrap();

        let mut framed = Vec::new();
        Frame::encode(b"payload", &mut framed).unwrap();
        server_stream.write_all(&framed).unwrap();
        drop(server_stream);

        let mut relay = Relay::new(
            client_stream,
            relay_udp,
            Some(sink_addr),
            false,
            TOKEN,
            None,
            None,
        );
        let result = relay.handle_stream_readable().unwrap();
        assert_eq!(result, None);

        let mut buf = [0u8; 16];
        sink_udp.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let (n, _) = sink_udp.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn forwards_zero_length_stream_frame_as_zero_byte_datagram() {
        let (client_stream, mut server_stream) = loopback_pair();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink_addr = sink_udp.local_addr().unwrap();

        let mut framed = Vec::new();
        Frame::encode(b"", &mut framed).unwrap();
        server_stream.write_all(&framed).unwrap();
        drop(server_stream);

        let mut relay = Relay::new(
            client_stream,
            relay_udp,
            Some(sink_addr),
            false,
            TOKEN,
            None,
            None,
        );
        let result = relay.handle_stream_readable().unwrap();
        assert_eq!(result, None);

        let mut buf = [0u8; 16];
        sink_udp
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let (n, _) = sink_udp.recv_from(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn drops_frame_with_no_known_peer() {
        let (client_stream, mut server_stream) = loopback_pair();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut framed = Vec::new();
        Frame::encode(b"nobody-home", &mut framed).unwrap();
        server_stream.write_all(&framed).unwrap();
        drop(server_stream);

        let mut relay = Relay::new(client_stream, relay_udp, None, false, TOKEN, None, None);
        let result = relay.handle_stream_readable().unwrap();
        assert_eq!(result, None);
        assert!(relay.peer_addr.is_none());
    }

    #[test]
    fn stream_eof_terminates_cleanly() {
        let (client_stream, server_stream) = loopback_pair();
        drop(server_stream);
        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut relay = Relay::new(client_stream, relay_udp, None, false, TOKEN, None, None);
        let result = relay.handle_stream_readable().unwrap();
        assert_eq!(result, Some(Termination::StreamClosed));
    }

    #[test]
    fn handshake_mismatch_terminates_without_error() {
        let (client_stream, mut server_stream) = loopback_pair();
        let mut bad_handshake = TOKEN;
        bad_handshake[0] ^= 0xFF;
        server_stream.write_all(&bad_handshake).unwrap();
        drop(server_stream);

        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut relay = Relay::new(client_stream, relay_udp, None, true, TOKEN, None, None);
        let result = relay.handle_stream_readable().unwrap();
        assert_eq!(result, Some(Termination::HandshakeRejected));
    }

    #[test]
    fn zero_length_datagram_is_dropped_not_forwarded() {
        let (client_stream, _server_stream) = loopback_pair();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let relay_addr = relay_udp.local_addr().unwrap();

        let mut relay = Relay::new(client_stream, relay_udp, None, false, TOKEN, None, None);
        sender.send_to(&[], relay_addr).unwrap();
        relay.handle_datagram_readable().unwrap();
        assert_eq!(relay.peer_addr, Some(sender.local_addr().unwrap()));
    }

    #[test]
    fn send_datagram_ignores_unknown_peer() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(send_datagram(&socket, None, b"nobody-home").is_ok());
    }

    #[test]
    fn send_datagram_delivers_to_known_peer() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        send_datagram(&socket, Some(receiver_addr), b"hi").unwrap();

        let mut buf = [0u8; 8];
        receiver
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
