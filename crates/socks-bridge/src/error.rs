//! Error types for the bridge

use crate::socks5::ReplyCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Failures while reading the client's proxy request header block.
///
/// All of these are fatal to the connection. None of them produce an HTTP
/// response: the client socket is simply closed.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header block exceeds {} bytes", crate::http::MAX_HEADER_SIZE)]
    HeaderTooLong,

    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid header line")]
    InvalidHeader,

    #[error("missing Host header")]
    MissingHost,

    #[error("invalid Host header")]
    InvalidHost,

    #[error("connection closed before end of header")]
    ConnectionClosed,

    #[error("timed out reading header")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every way a SOCKS5 handshake attempt can fail.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("upstream refused the connection")]
    ConnectionRefused,

    #[error("upstream host unreachable")]
    HostUnreachable,

    #[error("connection reset by upstream")]
    ConnectionReset,

    #[error("error talking to upstream")]
    ConnectionError,

    #[error("upstream rejected the credentials")]
    AuthenticationError,

    #[error("malformed response from upstream")]
    InvalidProxyResponse,

    #[error("unexpected handshake failure")]
    UnknownError,

    #[error("upstream replied: {0}")]
    Rejected(ReplyCode),
}

impl HandshakeError {
    /// Stable name reported to clients in the `X-Proxy-Error-Type` header.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "ConnectionRefused",
            Self::HostUnreachable => "HostUnreachable",
            Self::ConnectionReset => "ConnectionReset",
            Self::ConnectionError => "ConnectionError",
            Self::AuthenticationError => "AuthenticationError",
            Self::InvalidProxyResponse => "InvalidProxyResponse",
            Self::UnknownError => "UnknownError",
            Self::Rejected(code) => code.name(),
        }
    }

    /// Classify an I/O failure on the upstream socket.
    ///
    /// A short read means the proxy hung up mid-negotiation, which is a
    /// protocol violation rather than a transport failure.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => Self::HostUnreachable,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::ConnectionReset
            }
            ErrorKind::UnexpectedEof => Self::InvalidProxyResponse,
            _ => Self::ConnectionError,
        }
    }
}
