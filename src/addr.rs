//! Address string parsing and resolution.
//!
//! Accepts the grammar described for the CLI's positional arguments:
//! `[host]:port`, `host:port`, `port`, or `host`, where an IPv6 literal
//! without brackets and without a port is also accepted as long as it has
//! more than one colon (which otherwise would be ambiguous with
//! `host:port`). Resolution to concrete [`SocketAddr`]s is delegated to
//! `std::net::ToSocketAddrs`, the stdlib's `getaddrinfo` equivalent.

use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

/// Errors produced while parsing or resolving an address string.
#[derive(Debug, Error)]
pub enum Error {
    /// The string required a port (listener address) but none was given.
    #[error("missing port in '{0}'")]
    MissingPort(String),
    /// The string required both a host and a port (client address) but one
    /// was missing.
    #[error("missing address or port in '{0}'")]
    MissingAddressOrPort(String),
    /// The port could not be parsed as a `u16`.
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    /// Resolution (DNS or service lookup) failed.
    #[error("cannot resolve {0}: {1}")]
    Resolution(String, #[source] std::io::Error),
    /// Resolution produced no addresses at all.
    #[error("{0} resolved to no addresses")]
    NoAddresses(String),
}

/// The two optional components of an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    /// Host or literal address, if present.
    pub host: Option<String>,
    /// Port, if present.
    pub port: Option<u16>,
}

/// Parse the grammar described in the module documentation.
pub fn parse(input: &str) -> Result<ParsedAddress, Error> {
    if input.is_empty() {
        return Ok(ParsedAddress {
            host: None,
            port: None,
        });
    }

    if let Some(rest) = input.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let after = &rest[end + 1..];
            let port = match after.strip_prefix(':') {
                Some(p) if !p.is_empty() => Some(parse_port(p)?),
                _ => None,
            };
            return Ok(ParsedAddress {
                host: Some(host),
                port,
            });
        }
    }

    if let Some(first_colon) = input.find(':') {
        if input[first_colon + 1..].contains(':') {
            // Multiple colons with no brackets: an unadorned IPv6 literal,
            // which cannot carry a port in this position (ambiguous).
            return Ok(ParsedAddress {
                host: Some(input.to_string()),
                port: None,
            });
        }

        let (host_part, port_part) = input.split_at(first_colon);
        let port_part = &port_part[1..];
        let host = if host_part.is_empty() {
            None
        } else {
            Some(host_part.to_string())
        };
        let port = if port_part.is_empty() {
            None
        } else {
            Some(parse_port(port_part)?)
        };
        return Ok(ParsedAddress { host, port });
    }

    if input.bytes().all(|b| b.is_ascii_digit()) {
        Ok(ParsedAddress {
            host: None,
            port: Some(parse_port(input)?),
        })
    } else {
        Ok(ParsedAddress {
            host: Some(input.to_string()),
            port: None,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    s.parse::<u16>().map_err(|_| Error::InvalidPort(s.to_string()))
}

/// Resolve `host:port` to every matching [`SocketAddr`], both address
/// families included. Used by client-style lookups where both host and
/// port are required.
pub fn resolve_host_port(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let target = format!("{host}:{port}");
    resolve_str(&target)
}

/// Resolve a wildcard listener address (no host given) for both families:
/// `[::]:port` and `0.0.0.0:port`, IPv6 first.
pub fn resolve_wildcard(port: u16) -> Result<Vec<SocketAddr>, Error> {
    let mut addrs = Vec::new();
    addrs.extend(resolve_str(&format!("[::]:{port}"))?);
    addrs.extend(resolve_str(&format!("0.0.0.0:{port}"))?);
    Ok(addrs)
}

fn resolve_str(target: &str) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = target
        .to_socket_addrs()
        .map_err(|e| Error::Resolution(target.to_string(), e))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::NoAddresses(target.to_string()));
    }
    Ok(addrs)
}
