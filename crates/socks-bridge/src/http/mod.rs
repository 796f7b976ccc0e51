//! HTTP proxy front end

mod handler;
mod parser;

pub use handler::ConnectionHandler;
pub use parser::{find_header_end, parse_header_block, read_request, read_request_with_timeout};

use crate::error::HandshakeError;
use crate::socks5::ReplyCode;
use bytes::Bytes;

/// Upper bound on the request header block, terminator included.
pub const MAX_HEADER_SIZE: usize = 8192;

/// Headers that only make sense between the client and this proxy.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Value of the `Proxy-Agent` header on CONNECT replies.
pub const PROXY_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// One proxy request, as read off a freshly accepted client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Method token exactly as sent
    pub method: String,
    /// CONNECT request (raw tunnel) rather than a forwarded request
    pub tunnel: bool,
    /// Target host from the Host header, brackets stripped for IPv6
    pub host: String,
    /// Target port, defaulted from the mode when the Host header has none
    pub port: u16,
    /// Protocol version token from the request line, e.g. `HTTP/1.1`
    pub version: String,
    /// Request line plus filtered headers and a blank line; forward mode only
    pub rewritten: Option<Bytes>,
    /// Bytes that arrived after the header terminator
    pub leftover: Bytes,
}

impl ParsedRequest {
    /// `200` reply that opens a CONNECT tunnel
    pub fn connection_established(&self) -> String {
        format!(
            "{} 200 Connection established\r\nProxy-Agent: {}\r\n\r\n",
            self.version, PROXY_AGENT
        )
    }

    /// Reply sent to the client when no tunnel could be opened
    pub fn handshake_failure(&self, err: &HandshakeError) -> String {
        match err {
            HandshakeError::ConnectionRefused
            | HandshakeError::HostUnreachable
            | HandshakeError::ConnectionReset
            | HandshakeError::Rejected(ReplyCode::HostUnreachable)
            | HandshakeError::Rejected(ReplyCode::ConnectionRefused) => {
                format!("{} 502 Bad Gateway\r\n\r\n", self.version)
            }
            HandshakeError::AuthenticationError => {
                format!("{} 401 Unauthorized\r\n\r\n", self.version)
            }
            other => format!(
                "{} 500 Internal Server Error\r\nX-Proxy-Error-Type: {}\r\n\r\n",
                self.version,
                other.kind()
            ),
        }
    }
}
