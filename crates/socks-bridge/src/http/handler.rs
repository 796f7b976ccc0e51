//! Per-connection pipeline: parse, open tunnel, reply, relay

use super::read_request_with_timeout;
use crate::{
    error::{ProxyError, Result},
    relay::{relay, RelayStats},
    socks5::Socks5Connector,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Drives one accepted client connection from request to teardown
#[derive(Clone)]
pub struct ConnectionHandler {
    connector: Socks5Connector,
    header_timeout: Option<Duration>,
}

impl ConnectionHandler {
    pub fn new(connector: Socks5Connector) -> Self {
        Self {
            connector,
            header_timeout: None,
        }
    }

    pub fn with_header_timeout(mut self, limit: Option<Duration>) -> Self {
        self.header_timeout = limit;
        self
    }

    /// Handle an incoming connection.
    ///
    /// Parse failures close the client without a response. Handshake
    /// failures are answered with an HTTP error status first. Errors once
    /// relaying has begun are not reported at all.
    pub async fn handle_connection(&self, mut client: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let request = match read_request_with_timeout(&mut client, self.header_timeout).await {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping {}: {}", peer_addr, e);
                return Err(e.into());
            }
        };

        debug!(
            "{} {}:{} from {}",
            request.method, request.host, request.port, peer_addr
        );

        let mut upstream = match self.connector.connect(&request.host, request.port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "SOCKS5 connection to {}:{} for {} failed: {}",
                    request.host, request.port, peer_addr, e
                );
                let _ = client
                    .write_all(request.handshake_failure(&e).as_bytes())
                    .await;
                let _ = client.shutdown().await;
                return Err(ProxyError::Handshake(e));
            }
        };

        if request.tunnel {
            client
                .write_all(request.connection_established().as_bytes())
                .await?;
        } else if let Some(head) = &request.rewritten {
            if let Err(e) = upstream.write_all(head).await {
                debug!("Failed to forward request head for {}: {}", peer_addr, e);
                return Ok(());
            }
        }

        if !request.leftover.is_empty() {
            if let Err(e) = upstream.write_all(&request.leftover).await {
                debug!("Failed to forward buffered body for {}: {}", peer_addr, e);
                return Ok(());
            }
        }

        let RelayStats {
            client_to_upstream,
            upstream_to_client,
        } = relay(client, upstream).await;

        debug!(
            "Connection from {} closed ({} bytes up, {} bytes down)",
            peer_addr, client_to_upstream, upstream_to_client
        );

        Ok(())
    }
}
