//! Connection acceptor.
//!
//! [`accept_connections`] multiplexes an arbitrary number of listening TCP
//! sockets with `nix::poll` and hands each accepted connection to a freshly
//! forked child process. This is deliberately real OS-process isolation,
//! not a thread pool and not an async task: every tunnel session gets its
//! own address space, and a crashing session cannot corrupt another one's
//! state. [`install_sigchld_reaper`] keeps the parent's process table clean
//! by reaping terminated children whenever `SIGCHLD` arrives.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::raw::c_int;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tracing::info;

/// Errors produced while accepting connections.
#[derive(Debug, Error)]
pub enum Error {
    /// The readiness multiplexer failed.
    #[error("poll failed: {0}")]
    Poll(#[source] Errno),
    /// `accept()` failed for a reason other than a transient would-block.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    /// `fork()` failed.
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),
    /// A listening socket could not be switched to non-blocking mode.
    #[error("cannot set listener non-blocking: {0}")]
    NonBlocking(#[source] std::io::Error),
    /// Installing the `SIGCHLD` handler failed.
    #[error("cannot install SIGCHLD handler: {0}")]
    SignalInstall(#[source] Errno),
}

/// Install a `SIGCHLD` handler that reaps every terminated child with a
/// non-blocking `waitpid` loop, so forked tunnel sessions never linger as
/// zombies. Call this once, before [`accept_connections`].
pub fn install_sigchld_reaper() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(reap_children),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: reap_children only calls async-signal-safe functions (waitpid).
    unsafe { signal::sigaction(Signal::SIGCHLD, &action) }.map_err(Error::SignalInstall)?;
    Ok(())
}

extern "C" fn reap_children(_signal: c_int) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

/// Accept connections forever, forking a child for each one.
///
/// The parent never returns from this function: it keeps accepting and
/// forking. Each child returns exactly once, with its own accepted
/// connection and every listening socket closed (the child has no use for
/// them, and holding them open would keep the listen backlog alive after
/// the parent exits).
pub fn accept_connections(listeners: Vec<TcpListener>) -> Result<(TcpStream, SocketAddr), Error> {
    for listener in &listeners {
        listener.set_nonblocking(true).map_err(Error::NonBlocking)?;
    }

    loop {
        let mut fds: Vec<PollFd> = listeners
            .iter()
            .map(|l| PollFd::new(l.as_fd(), PollFlags::POLLIN))
            .collect();

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Poll(e)),
        }

        for (listener, pollfd) in listeners.iter().zip(fds.iter()) {
            let ready = pollfd
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if !ready {
                continue;
            }

            let (stream, peer) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Accept(e)),
            };
            info!(remote = %peer, "received a TCP connection");

            // SAFETY: fork() is called with no other threads in the
            // process and no non-async-signal-safe state is touched
            // before the child either execs (it doesn't) or returns.
            match unsafe { fork() }.map_err(Error::Fork)? {
                ForkResult::Parent { .. } => {
                    drop(stream);
                }
                ForkResult::Child => {
                    // `listeners` (and this iteration's poll fds) are
                    // dropped by the ordinary end-of-scope rules as this
                    // function returns, closing every listening socket in
                    // the child before it touches the accepted stream.
                    return Ok((stream, peer));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn listeners_switch_to_nonblocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(TcpListener::bind(addr).is_err());
    }

    #[test]
    fn accept_without_pending_connection_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn accept_succeeds_once_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        let (stream, _peer) = listener.accept().unwrap();
        drop(stream);
    }

    #[test]
    fn reap_children_clears_an_exited_child_without_blocking() {
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => std::process::exit(0),
            ForkResult::Parent { child } => child,
        };

        // Give the child a moment to exit before reaping, then drain it the
        // same way the SIGCHLD handler does: non-blocking, in a loop, until
        // no exited child remains.
        std::thread::sleep(std::time::Duration::from_millis(50));
        reap_children(0);

        // The child is already reaped; waitpid on it now must fail rather
        // than block, proving reap_children actually consumed its status.
        let err = waitpid(child, Some(WaitPidFlag::WNOHANG)).unwrap_err();
        assert_eq!(err, Errno::ECHILD);
    }

    #[test]
    fn install_sigchld_reaper_reaps_a_forked_child() {
        install_sigchld_reaper().unwrap();

        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => std::process::exit(0),
            ForkResult::Parent { child } => child,
        };

        // SIGCHLD delivery should drive reap_children without any explicit
        // waitpid call from this thread.
        std::thread::sleep(std::time::Duration::from_millis(200));
        let err = waitpid(child, Some(WaitPidFlag::WNOHANG)).unwrap_err();
        assert_eq!(err, Errno::ECHILD);
    }
}
