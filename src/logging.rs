//! Structured logging initialization.
//!
//! Builds the one process-wide `tracing` subscriber from the parsed
//! verbosity count and `--syslog` flag. This is the only place the log
//! filter level is set; nothing downstream of [`init`] touches it again.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// RFC3339 timestamps in the process's local offset, following
/// `format_rfc3339_timestamp` (log.c), which builds its timestamp from
/// `localtime()` plus a numeric `%z` offset rather than UTC. Falls back to
/// UTC if the local offset cannot be determined (e.g. a multi-threaded
/// process on a platform where reading it isn't sound).
struct LocalRfc3339;

impl FormatTime for LocalRfc3339 {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now.format(&Rfc3339).map_err(|_| std::fmt::Error)?;
        write!(w, "{formatted}")
    }
}

/// Errors produced while initializing logging.
#[derive(Debug, Error)]
pub enum Error {
    /// The syslog socket could not be opened.
    #[error("cannot open syslog: {0}")]
    Syslog(#[source] io::Error),
}

/// Translate the repeated `-v` count into the effective filter level,
/// following the original four-step scheme (`log_warning` through
/// `log_debug`). `-v` and `-vv` both land on `INFO`: in the original, the
/// difference between "notice" and "info" output is which call sites log
/// at all, not a distinct filter threshold, since `tracing` has no NOTICE
/// level between WARN and INFO.
fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 | 2 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// Initialize the global subscriber. `syslog` routes formatted records to
/// the system log instead of stderr, matching the original's dual
/// `vfprintf`/`vsyslog` log sink.
pub fn init(verbosity: u8, syslog: bool) -> Result<(), Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_for(verbosity).into())
        .from_env_lossy();

    if syslog {
        init_syslog(filter)
    } else {
        tracing_subscriber::fmt()
            .with_timer(LocalRfc3339)
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
        Ok(())
    }
}

fn init_syslog(filter: EnvFilter) -> Result<(), Error> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "udptunnel".into(),
        pid: std::process::id() as i32,
    };
    let logger = syslog::unix(formatter)
        .map_err(|e| Error::Syslog(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
    let logger = Arc::new(Mutex::new(logger));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(move || SyslogWriter {
            logger: Arc::clone(&logger),
        })
        .init();
    Ok(())
}

/// Adapts a `syslog` logger to the `std::io::Write` interface
/// `tracing-subscriber`'s formatter writes lines into.
struct SyslogWriter {
    logger: Arc<Mutex<Logger<LoggerBackend, Formatter3164>>>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        if let Ok(mut logger) = self.logger.lock() {
            let _ = logger.info(line.trim_end());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
