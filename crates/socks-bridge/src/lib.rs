//! HTTP to SOCKS5 bridge
//!
//! This crate runs a local HTTP proxy that forwards every request through an
//! upstream SOCKS5 server, so clients that only speak HTTP proxy can reach
//! destinations behind SOCKS5.

pub mod config;
pub mod error;
pub mod http;
pub mod relay;
pub mod socks5;

pub use config::{BridgeConfig, Credentials, TimeoutConfig, UpstreamConfig};
pub use error::{HandshakeError, ParseError, ProxyError, Result};
pub use http::{ConnectionHandler, ParsedRequest};
pub use relay::{relay, RelayPair, RelayStats};
pub use socks5::Socks5Connector;

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Result of one SOCKS5 handshake attempt: the connected tunnel, or why
/// there is none.
pub type HandshakeOutcome = std::result::Result<tokio::net::TcpStream, HandshakeError>;

const LISTEN_BACKLOG: i32 = 1024;

/// Local HTTP proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    handler: ConnectionHandler,
    upstream: Arc<UpstreamConfig>,
}

impl ProxyServer {
    /// Resolve the upstream and bind the listener described by `config`
    pub async fn from_config(config: &BridgeConfig) -> Result<Self> {
        let upstream = config.resolve().await?;
        let server = Self::bind(upstream, config.listen_port).await?;
        Ok(server.with_header_timeout(config.timeouts.header_read()))
    }

    /// Bind on all interfaces, IPv4 and IPv6 where the host allows it.
    /// Port 0 picks an ephemeral port.
    pub async fn bind(upstream: Arc<UpstreamConfig>, port: u16) -> Result<Self> {
        let listener = TcpListener::from_std(bind_listener(port)?)?;
        let handler = ConnectionHandler::new(Socks5Connector::new(Arc::clone(&upstream)));

        Ok(Self {
            listener,
            handler,
            upstream,
        })
    }

    pub fn with_header_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handler = self.handler.with_header_timeout(limit);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address to configure HTTP clients with
    pub fn proxy_uri(&self) -> Result<String> {
        Ok(format!("http://127.0.0.1:{}", self.local_addr()?.port()))
    }

    /// Accept connections until the listener itself fails.
    ///
    /// Every connection runs on its own task; a failing connection never
    /// affects the loop or other connections.
    pub async fn run(self) -> Result<()> {
        info!(
            "HTTP proxy listening on {} (SOCKS5 upstream {})",
            self.local_addr()?,
            self.upstream.address
        );

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let _ = socket.set_nodelay(true);
                    let handler = self.handler.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(socket, peer_addr).await {
                            debug!("Connection from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!("Accept failed for one connection: {}", e);
                }
                Err(e) if is_descriptor_exhaustion(&e) => {
                    warn!("Accept failed, out of file descriptors: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    error!("Listener failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}

fn bind_listener(port: u16) -> io::Result<std::net::TcpListener> {
    match bind_socket(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), true) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!("Dual-stack bind unavailable ({}), using IPv4 only", e);
            bind_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), false)
        }
    }
}

fn bind_socket(addr: SocketAddr, dual_stack: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

// ENFILE / EMFILE
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let upstream = Arc::new(UpstreamConfig::new("127.0.0.1:1080".parse().unwrap()));
        let server = ProxyServer::bind(upstream, 0).await.unwrap();

        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(
            server.proxy_uri().unwrap(),
            format!("http://127.0.0.1:{}", addr.port())
        );
    }

    #[tokio::test]
    async fn test_accepts_ipv4_clients() {
        let upstream = Arc::new(UpstreamConfig::new("127.0.0.1:1080".parse().unwrap()));
        let server = ProxyServer::bind(upstream, 0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_dual_stack_accepts_ipv6_and_ipv4_clients() {
        let ipv6_available = bind_socket(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)), true).is_ok();

        let upstream = Arc::new(UpstreamConfig::new("127.0.0.1:1080".parse().unwrap()));
        let server = ProxyServer::bind(upstream, 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_eq!(addr.is_ipv6(), ipv6_available);
        if !ipv6_available {
            // IPv4-only host
            return;
        }

        match tokio::net::TcpStream::connect((Ipv6Addr::LOCALHOST, addr.port())).await {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrNotAvailable
                        | io::ErrorKind::NetworkUnreachable
                        | io::ErrorKind::HostUnreachable
                ) =>
            {
                // IPv6 sockets work but no loopback address is configured
                return;
            }
            Err(e) => panic!("IPv6 client rejected: {}", e),
        }

        let ipv4 = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).await;
        assert!(ipv4.is_ok());
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(24)));
        assert!(!is_descriptor_exhaustion(&io::Error::from_raw_os_error(13)));
    }
}
