//! SOCKS5 client side (RFC 1928, plus RFC 1929 username/password)

mod handshake;
mod protocol;

pub use handshake::Socks5Connector;
pub use protocol::{
    build_auth_request, build_connect_request, build_greeting, parse_connect_reply,
    TargetAddress,
};

pub const SOCKS_VERSION: u8 = 0x05;
pub const SUBNEGOTIATION_VERSION: u8 = 0x01;
pub const RESERVED: u8 = 0x00;

/// SOCKS5 authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    GssApi = 0x01,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

impl AuthMethod {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::NoAuth),
            0x01 => Some(Self::GssApi),
            0x02 => Some(Self::UserPass),
            0xFF => Some(Self::NoAcceptable),
            _ => None,
        }
    }
}

/// SOCKS5 command. Only CONNECT is ever sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// SOCKS5 address type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    IPv4 = 0x01,
    Domain = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IPv4),
            0x03 => Some(Self::Domain),
            0x04 => Some(Self::IPv6),
            _ => None,
        }
    }
}

/// Non-zero reply codes a SOCKS5 server may answer a request with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Map a reply byte; `0x00` (success) and anything above `0x08` are not
    /// failure codes.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::GeneralFailure),
            0x02 => Some(Self::ConnectionNotAllowed),
            0x03 => Some(Self::NetworkUnreachable),
            0x04 => Some(Self::HostUnreachable),
            0x05 => Some(Self::ConnectionRefused),
            0x06 => Some(Self::TtlExpired),
            0x07 => Some(Self::CommandNotSupported),
            0x08 => Some(Self::AddressTypeNotSupported),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GeneralFailure => "GeneralFailure",
            Self::ConnectionNotAllowed => "ConnectionNotAllowed",
            Self::NetworkUnreachable => "NetworkUnreachable",
            Self::HostUnreachable => "HostUnreachable",
            Self::ConnectionRefused => "ConnectionRefused",
            Self::TtlExpired => "TtlExpired",
            Self::CommandNotSupported => "CommandNotSupported",
            Self::AddressTypeNotSupported => "AddressTypeNotSupported",
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
