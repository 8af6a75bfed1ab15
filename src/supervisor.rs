//! Integration with an external socket-activation / super-server protocol.
//!
//! Follows the same environment-variable convention the original program
//! reads via `sd_listen_fds()`: `LISTEN_PID` must equal this process's pid,
//! `LISTEN_FDS` gives the count of pre-opened descriptors, and the
//! descriptors themselves start at fd 3. [`notify_ready`] emits the
//! companion `READY=1` notification once initialization is complete.

use std::net::{TcpListener, UdpSocket};
use std::os::fd::{BorrowedFd, FromRawFd, RawFd};

use nix::sys::socket::{getsockopt, sockopt::SockType as SockTypeOpt, SockType};
use thiserror::Error;

/// The descriptor number at which supervisor-passed sockets begin.
const LISTEN_FDS_START: RawFd = 3;

/// Errors produced while adopting supervisor-passed sockets.
#[derive(Debug, Error)]
pub enum Error {
    /// The `LISTEN_FDS` protocol demands exactly one datagram socket.
    #[error("UDP socket activation supports a single socket, got {0}")]
    WrongDatagramCount(usize),
    /// An inherited descriptor was not the expected datagram socket type.
    #[error("socket activation fd {0} is not a datagram socket")]
    NotADatagramSocket(RawFd),
    /// An inherited descriptor was not the expected listening stream type.
    #[error("socket activation fd {0} is not a stream socket")]
    NotAStreamSocket(RawFd),
    /// Querying the descriptor's socket type failed outright.
    #[error("cannot inspect socket activation fd {0}: {1}")]
    Inspect(RawFd, #[source] nix::Error),
}

/// Returns the number of sockets passed by the supervisor, or `None` if
/// this process was not started via socket activation (either the
/// environment variables are absent, or `LISTEN_PID` names a different
/// process (the same guard `sd_listen_fds()` applies, since environment
/// variables survive an `exec()` into an unrelated, non-activated child).
#[must_use]
pub fn listen_fds() -> Option<usize> {
    let listen_pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if listen_pid != std::process::id() {
        return None;
    }
    let count: usize = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if count == 0 {
        None
    } else {
        Some(count)
    }
}

/// Adopt the single inherited datagram socket. `n` must be `1`.
pub fn adopt_datagram_listener(n: usize) -> Result<UdpSocket, Error> {
    if n != 1 {
        return Err(Error::WrongDatagramCount(n));
    }
    let fd = LISTEN_FDS_START;
    check_socket_type(fd, SockType::Datagram, Error::NotADatagramSocket)?;
    // SAFETY: the supervisor protocol guarantees fd is open and owned by
    // this process for its lifetime; we take ownership here.
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

/// Adopt `n` inherited listening stream sockets.
pub fn adopt_stream_listeners(n: usize) -> Result<Vec<TcpListener>, Error> {
    let mut listeners = Vec::with_capacity(n);
    for i in 0..n {
        let fd = LISTEN_FDS_START + i as RawFd;
        check_socket_type(fd, SockType::Stream, Error::NotAStreamSocket)?;
        // SAFETY: see adopt_datagram_listener.
        listeners.push(unsafe { TcpListener::from_raw_fd(fd) });
    }
    Ok(listeners)
}

fn check_socket_type(
    fd: RawFd,
    expected: SockType,
    mismatch: impl FnOnce(RawFd) -> Error,
) -> Result<(), Error> {
    // SAFETY: the supervisor protocol guarantees fd is a valid, open
    // descriptor for the lifetime of this borrow.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let actual = getsockopt(&borrowed, SockTypeOpt).map_err(|e| Error::Inspect(fd, e))?;
    if actual == expected {
        Ok(())
    } else {
        Err(mismatch(fd))
    }
}

/// Open the single-connection inetd stream socket on fd 0.
#[must_use]
pub fn inetd_stream() -> std::net::TcpStream {
    // SAFETY: inetd/xinetd guarantee fd 0 is the connected client socket.
    unsafe { std::net::TcpStream::from_raw_fd(0) }
}

/// Open the single-connection inetd datagram socket on fd 0.
#[must_use]
pub fn inetd_datagram() -> UdpSocket {
    // SAFETY: inetd/xinetd guarantee fd 0 is the bound datagram socket.
    unsafe { UdpSocket::from_raw_fd(0) }
}

/// Tell the supervisor that initialization is complete.
///
/// Silently does nothing if there is no supervisor to notify (the
/// `NOTIFY_SOCKET` environment variable is unset), matching `sd_notify`'s
/// own behavior.
pub fn notify_ready() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!(error = %e, "sd_notify READY=1 failed (no supervisor listening?)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_fds_absent_by_default() {
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
        assert_eq!(listen_fds(), None);
    }

    #[test]
    fn listen_fds_requires_matching_pid() {
        std::env::set_var("LISTEN_PID", "1");
        std::env::set_var("LISTEN_FDS", "2");
        assert_eq!(listen_fds(), None);
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
    }
}
