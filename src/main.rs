//! `udptunnel`: tunnels UDP datagrams over a TCP connection and back.

mod acceptor;
mod addr;
mod cli;
mod codec;
mod error;
mod logging;
mod mode;
mod relay;
mod socket;
mod supervisor;

use clap::Parser;
use tracing::{error, info};

use error::Error;
use mode::{ClientConfig, ServerConfig, DEFAULT_HANDSHAKE};

fn main() {
    let cli = cli::Cli::parse();

    if let Err(e) = logging::init(cli.verbose, cli.syslog) {
        eprintln!("cannot initialize logging: {e}");
        std::process::exit(1);
    }

    match run(cli) {
        Ok(termination) => {
            info!(?termination, "exiting");
            std::process::exit(0);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: cli::Cli) -> Result<relay::Termination, Error> {
    let activated = supervisor::listen_fds().is_some();
    let expected_args = if activated || cli.inetd { 1 } else { 2 };

    if cli.addresses.len() != expected_args {
        return Err(Error::InvalidArguments(format!(
            "expected {expected_args} address argument(s), got {}",
            cli.addresses.len()
        )));
    }

    let timeout = cli.timeout.map(std::time::Duration::from_secs);
    let mut addresses = cli.addresses.into_iter();

    supervisor::notify_ready();

    if cli.server {
        let listen_addr = (expected_args == 2).then(|| addresses.next().unwrap());
        let egress_addr = addresses.next().unwrap();
        let termination = mode::run_server(ServerConfig {
            listen_addr,
            egress_addr,
            inetd: cli.inetd,
            stream_timeout: timeout,
            handshake: DEFAULT_HANDSHAKE,
        })?;
        Ok(termination)
    } else {
        let listen_addr = (expected_args == 2).then(|| addresses.next().unwrap());
        let egress_addr = addresses.next().unwrap();
        let termination = mode::run_client(ClientConfig {
            listen_addr,
            egress_addr,
            inetd: cli.inetd,
            datagram_timeout: timeout,
            handshake: DEFAULT_HANDSHAKE,
        })?;
        Ok(termination)
    }
}
