//! Socket setup shared by the relay client and server.
//!
//! [`SocketConfig`] holds the options applied to every relay connection
//! (`TCP_NODELAY`, keepalive, `SO_REUSEADDR`). [`resolve_candidates`] and
//! [`connect_any`] implement the client's address walk: a host name may map to
//! several addresses and each one is tried in order under a timeout.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// TCP options applied to every relay connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Relay frames are small and latency-bound.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Enable `SO_REUSEADDR` on listeners. Off on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply socket options to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind a listener with `SO_REUSEADDR` (when enabled) and dual-stack IPv6.
pub async fn create_listener(
    addr: SocketAddr,
    config: &SocketConfig,
) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

/// Resolve `host` to the addresses a client should try, in order.
///
/// A literal IPv4/IPv6 address is used as-is without a lookup. A name is
/// resolved through the system resolver and every returned address is kept.
pub async fn resolve_candidates(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{host} resolved to no addresses"),
        ));
    }
    Ok(addrs)
}

/// Try each candidate in order, returning the first stream that connects
/// within `timeout`.
///
/// Returns `None` when every candidate failed; individual failures are logged.
pub async fn connect_any(candidates: &[SocketAddr], timeout: Duration) -> Option<TcpStream> {
    for addr in candidates {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => tracing::debug!(%addr, error = %e, "connect attempt failed"),
            Err(_) => tracing::debug!(%addr, ?timeout, "connect attempt timed out"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_nodelay_is_set() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_is_configured() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_literal_ip_skips_lookup() {
        let addrs = resolve_candidates("10.1.2.3", 38281).await.unwrap();
        assert_eq!(addrs, vec!["10.1.2.3:38281".parse::<SocketAddr>().unwrap()]);

        let addrs = resolve_candidates("::1", 5).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:5".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let addrs = resolve_candidates("localhost", 4000).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 4000 && a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_connect_any_skips_dead_candidates() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default())
            .await
            .unwrap();
        let live = listener.local_addr().unwrap();

        // Grab a port and release it so nothing listens there.
        let dead = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };

        let stream = connect_any(&[dead, live], Duration::from_secs(2)).await;
        let stream = stream.expect("live candidate should connect");
        assert_eq!(stream.peer_addr().unwrap(), live);
    }

    #[tokio::test]
    async fn test_connect_any_all_dead() {
        let dead = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };
        assert!(connect_any(&[dead], Duration::from_millis(500)).await.is_none());
        assert!(connect_any(&[], Duration::from_millis(500)).await.is_none());
    }
}
