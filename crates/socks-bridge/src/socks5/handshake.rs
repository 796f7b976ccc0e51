//! SOCKS5 handshake driver

use super::protocol::{
    build_auth_request, build_connect_request, build_greeting, expected_reply_len,
    parse_auth_reply, parse_connect_reply, parse_greeting_reply, TargetAddress, MAX_REPLY_LEN,
};
use super::AuthMethod;
use crate::config::{Credentials, UpstreamConfig};
use crate::error::HandshakeError;
use crate::HandshakeOutcome;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Negotiation phases after the TCP connection is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeting,
    Authenticating,
    Requesting,
}

/// Opens tunnels through the configured SOCKS5 server
#[derive(Clone)]
pub struct Socks5Connector {
    upstream: Arc<UpstreamConfig>,
}

impl Socks5Connector {
    pub fn new(upstream: Arc<UpstreamConfig>) -> Self {
        Self { upstream }
    }

    /// Connect to `host:port` through the SOCKS5 server.
    ///
    /// If the server rejects our credentials the whole handshake is retried
    /// once offering only "no authentication". When that retry fails too the
    /// original authentication failure is reported.
    pub async fn connect(&self, host: &str, port: u16) -> HandshakeOutcome {
        let handshake = self.connect_with_fallback(host, port);

        match self.upstream.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("SOCKS5 handshake for {}:{} timed out after {:?}", host, port, limit);
                    Err(HandshakeError::ConnectionError)
                }
            },
            None => handshake.await,
        }
    }

    async fn connect_with_fallback(&self, host: &str, port: u16) -> HandshakeOutcome {
        let credentials = self.upstream.credentials.as_ref();

        match self.attempt(host, port, credentials).await {
            Err(HandshakeError::AuthenticationError) if credentials.is_some() => {
                debug!("Credentials rejected by {}, retrying without authentication", self.upstream.address);
                self.attempt(host, port, None).await.map_err(|e| {
                    debug!("No-auth fallback failed: {}", e);
                    HandshakeError::AuthenticationError
                })
            }
            outcome => outcome,
        }
    }

    async fn attempt(&self, host: &str, port: u16, credentials: Option<&Credentials>) -> HandshakeOutcome {
        let mut stream = TcpStream::connect(self.upstream.address).await.map_err(|e| {
            debug!("Failed to connect to SOCKS5 server {}: {}", self.upstream.address, e);
            HandshakeError::from_io(&e)
        })?;
        let _ = stream.set_nodelay(true);

        let target = self.target_address(host, port).await?;
        negotiate(&mut stream, &target, port, credentials).await?;

        debug!("SOCKS5 tunnel to {}:{} established", host, port);
        Ok(stream)
    }

    async fn target_address(&self, host: &str, port: u16) -> Result<TargetAddress, HandshakeError> {
        let target = TargetAddress::from_host(host);
        if !self.upstream.resolve_locally {
            return Ok(target);
        }

        match target {
            TargetAddress::Domain(name) => {
                let resolved = tokio::net::lookup_host((name.as_str(), port))
                    .await
                    .map_err(|e| {
                        debug!("Local resolution of {} failed: {}", name, e);
                        HandshakeError::UnknownError
                    })?
                    .next()
                    .ok_or(HandshakeError::UnknownError)?;
                Ok(TargetAddress::Ip(resolved.ip()))
            }
            ip => Ok(ip),
        }
    }
}

/// Run greeting, optional authentication and the CONNECT request over an
/// already-connected stream.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    target: &TargetAddress,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = State::Greeting;

    loop {
        state = match state {
            State::Greeting => {
                let offer_user_pass = credentials.is_some();
                stream
                    .write_all(&build_greeting(offer_user_pass))
                    .await
                    .map_err(io_failure)?;

                let mut reply = [0u8; 2];
                stream.read_exact(&mut reply).await.map_err(io_failure)?;

                match parse_greeting_reply(reply, offer_user_pass)? {
                    AuthMethod::UserPass => State::Authenticating,
                    _ => State::Requesting,
                }
            }
            State::Authenticating => {
                let credentials = credentials.ok_or(HandshakeError::InvalidProxyResponse)?;
                stream
                    .write_all(&build_auth_request(credentials)?)
                    .await
                    .map_err(io_failure)?;

                let mut reply = [0u8; 2];
                stream.read_exact(&mut reply).await.map_err(io_failure)?;

                if !parse_auth_reply(reply)? {
                    return Err(HandshakeError::AuthenticationError);
                }
                State::Requesting
            }
            State::Requesting => {
                stream
                    .write_all(&build_connect_request(target, port)?)
                    .await
                    .map_err(io_failure)?;
                stream.flush().await.map_err(io_failure)?;

                return read_connect_reply(stream).await;
            }
        };
    }
}

/// Read exactly as much of the CONNECT reply as its header announces.
async fn read_connect_reply<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_REPLY_LEN];
    let mut filled = 0;

    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await.map_err(io_failure)?;
        if n == 0 {
            break;
        }
        filled += n;

        if matches!(expected_reply_len(&buf[..filled]), Some(expected) if filled >= expected) {
            break;
        }
    }

    parse_connect_reply(&buf[..filled])
}

fn io_failure(err: std::io::Error) -> HandshakeError {
    debug!("SOCKS5 I/O failure: {}", err);
    HandshakeError::from_io(&err)
}
