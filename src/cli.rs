//! Command-line surface.
//!
//! A thin `clap` derive struct, mirroring how `lading`'s binaries define
//! their `Args`/`Config` entry point. `clap` owns `--help`/`-h` (exit `0`)
//! and malformed-invocation handling (exit `2`) for free; the only
//! argument-count validation this crate still has to do by hand is the
//! standalone-vs-supervisor-activated address count, since that depends on
//! environment state `clap` doesn't see.

use clap::Parser;

/// Tunnels UDP datagrams over a TCP connection and back.
#[derive(Debug, Parser)]
#[clap(name = "udptunnel", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Server mode (stream-ingress, datagram-egress). Default: client mode.
    #[clap(short, long)]
    pub server: bool,

    /// The stream (server) or datagram (client) socket is inherited on
    /// descriptor 0.
    #[clap(short, long)]
    pub inetd: bool,

    /// Idle timeout in seconds for the inbound side of the configured role.
    #[clap(short = 'T', long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Route logs to the system log sink.
    #[clap(short = 'S', long)]
    pub syslog: bool,

    /// Increase log verbosity; repeatable (notice -> info -> debug).
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// `[SOURCE:]PORT` followed by `DESTINATION:PORT`, or just
    /// `DESTINATION:PORT` when started under a supervisor or inetd.
    #[clap(value_name = "ADDRESS", min_values = 1, max_values = 2)]
    pub addresses: Vec<String>,
}
