//! Listening socket setup.
//!
//! # Responsibilities
//! - Resolve the configured host to a socket address of the right family
//! - Bind the listening socket (blocking std socket, handed to Tokio later)
//! - Check whether a port is free before the reloader starts
//!
//! # Design Decisions
//! - A host containing `:` is an IPv6 literal (brackets allowed)
//! - `*` or an empty host means every IPv4 interface
//! - Names resolve through the system resolver, IPv4 preferred

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// The host could not be turned into an address.
    Resolve { host: String, source: std::io::Error },
    /// Failed to bind to address.
    Bind { addr: SocketAddr, source: std::io::Error },
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Resolve { host, source } => {
                write!(f, "Failed to resolve '{}': {}", host, source)
            }
            ListenerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)?;
                if source.kind() == std::io::ErrorKind::AddrInUse {
                    write!(
                        f,
                        " (either another program is using this port, or another \
                         instance of this server is still running)"
                    )?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Resolve { source, .. } | ListenerError::Bind { source, .. } => {
                Some(source)
            }
        }
    }
}

/// Resolve `host` and `port` to the address the server binds.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let host = host.trim();
    if host.is_empty() || host == "*" {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    if host.contains(':') {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        let ip: Ipv6Addr = literal.parse().map_err(|e| ListenerError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
        return Ok(SocketAddr::new(IpAddr::V6(ip), port));
    }

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }

    let resolve_err = |source| ListenerError::Resolve {
        host: host.to_string(),
        source,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(resolve_err)?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            resolve_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses found",
            ))
        })
}

/// Bind the listening socket.
pub fn bind(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let addr = resolve(host, port)?;
    let listener = TcpListener::bind(addr).map_err(|source| ListenerError::Bind { addr, source })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ListenerError::Bind { addr, source })?;
    tracing::debug!(address = %local_addr, "Listener bound");

    Ok(listener)
}

/// Bind and immediately release the address, failing if it is taken.
///
/// The reloading supervisor never serves itself; this surfaces a busy port
/// before any worker is spawned.
pub fn ensure_available(host: &str, port: u16) -> Result<(), ListenerError> {
    bind(host, port).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_address_family_from_host() {
        assert_eq!(resolve("*", 80).unwrap(), "0.0.0.0:80".parse().unwrap());
        assert_eq!(resolve("", 80).unwrap(), "0.0.0.0:80".parse().unwrap());
        assert_eq!(resolve("::1", 80).unwrap(), "[::1]:80".parse().unwrap());
        assert_eq!(resolve("[::]", 81).unwrap(), "[::]:81".parse().unwrap());
        assert_eq!(
            resolve("127.0.0.1", 82).unwrap(),
            "127.0.0.1:82".parse().unwrap()
        );
        assert!(resolve(":::bogus", 80).is_err());
    }

    #[test]
    fn localhost_prefers_ipv4() {
        let addr = resolve("localhost", 8080).unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn busy_port_is_reported() {
        let held = bind("127.0.0.1", 0).unwrap();
        let port = held.local_addr().unwrap().port();

        let err = ensure_available("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
        assert!(err.to_string().contains("another program"));

        drop(held);
        assert!(ensure_available("127.0.0.1", port).is_ok());
    }
}
