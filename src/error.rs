//! Top-level error type and exit-code mapping.
//!
//! Every module's `Error` composes into this one at the binary boundary,
//! the way `lading`'s per-generator errors compose into `generator::Error`.
//! [`Error::exit_code`] implements the process exit table: `2` for
//! misuse, `1` for everything else that reaches here (a clean shutdown:
//! peer close, idle timeout, handshake rejection; represented by
//! `relay::Termination`, not by an `Error`, and always exits `0`).

use thiserror::Error as ThisError;

use crate::{acceptor, addr, logging, relay, socket, supervisor};

/// The crate's top-level error type.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The CLI was invoked with the wrong number of positional addresses
    /// for the active mode (standalone vs. supervisor-activated).
    #[error("{0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Addr(#[from] addr::Error),
    #[error(transparent)]
    Socket(#[from] socket::Error),
    #[error(transparent)]
    Supervisor(#[from] supervisor::Error),
    #[error(transparent)]
    Acceptor(#[from] acceptor::Error),
    #[error(transparent)]
    Relay(#[from] relay::Error),
    #[error(transparent)]
    Logging(#[from] logging::Error),
}

impl Error {
    /// The process exit code this error should produce, per the original
    /// program's error taxonomy.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArguments(_) => 2,
            Error::Addr(_)
            | Error::Socket(_)
            | Error::Supervisor(_)
            | Error::Acceptor(_)
            | Error::Relay(_)
            | Error::Logging(_) => 1,
        }
    }
}
