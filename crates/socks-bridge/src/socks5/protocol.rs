//! SOCKS5 wire messages

use super::{AddressType, AuthMethod, Command, ReplyCode, RESERVED, SOCKS_VERSION, SUBNEGOTIATION_VERSION};
use crate::config::Credentials;
use crate::error::HandshakeError;
use std::net::IpAddr;

/// Largest CONNECT reply: header, length byte, 255-byte domain, port.
pub(crate) const MAX_REPLY_LEN: usize = 4 + 1 + 255 + 2;

/// Shortest reply accepted before any address-specific length check.
const MIN_REPLY_LEN: usize = 8;

/// Destination as it goes into a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddress {
    Ip(IpAddr),
    Domain(String),
}

impl TargetAddress {
    /// Literal IPv4/IPv6 addresses are sent as such, anything else as a
    /// domain name for the SOCKS5 server to resolve.
    pub fn from_host(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Domain(host.to_string()),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Self::Ip(IpAddr::V4(_)) => AddressType::IPv4,
            Self::Ip(IpAddr::V6(_)) => AddressType::IPv6,
            Self::Domain(_) => AddressType::Domain,
        }
    }
}

/// Version identifier/method selection message
pub fn build_greeting(offer_user_pass: bool) -> Vec<u8> {
    if offer_user_pass {
        vec![
            SOCKS_VERSION,
            2,
            AuthMethod::NoAuth as u8,
            AuthMethod::UserPass as u8,
        ]
    } else {
        vec![SOCKS_VERSION, 1, AuthMethod::NoAuth as u8]
    }
}

/// Interpret the server's method selection
pub fn parse_greeting_reply(reply: [u8; 2], offered_user_pass: bool) -> Result<AuthMethod, HandshakeError> {
    if reply[0] != SOCKS_VERSION {
        return Err(HandshakeError::InvalidProxyResponse);
    }

    match AuthMethod::from_byte(reply[1]) {
        Some(AuthMethod::NoAuth) => Ok(AuthMethod::NoAuth),
        Some(AuthMethod::UserPass) if offered_user_pass => Ok(AuthMethod::UserPass),
        // Asking for a method we never offered, or refusing all of them
        _ => Err(HandshakeError::InvalidProxyResponse),
    }
}

/// RFC 1929 username/password request
pub fn build_auth_request(credentials: &Credentials) -> Result<Vec<u8>, HandshakeError> {
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_bytes();
    let ulen = u8::try_from(username.len()).map_err(|_| HandshakeError::UnknownError)?;
    let plen = u8::try_from(password.len()).map_err(|_| HandshakeError::UnknownError)?;

    let mut message = Vec::with_capacity(3 + username.len() + password.len());
    message.push(SUBNEGOTIATION_VERSION);
    message.push(ulen);
    message.extend_from_slice(username);
    message.push(plen);
    message.extend_from_slice(password);
    Ok(message)
}

/// Interpret the subnegotiation status; `Ok(false)` means the server
/// rejected the credentials.
pub fn parse_auth_reply(reply: [u8; 2]) -> Result<bool, HandshakeError> {
    if reply[0] != SUBNEGOTIATION_VERSION {
        return Err(HandshakeError::InvalidProxyResponse);
    }
    Ok(reply[1] == 0x00)
}

/// CONNECT request for `target:port`
pub fn build_connect_request(target: &TargetAddress, port: u16) -> Result<Vec<u8>, HandshakeError> {
    let mut request = vec![
        SOCKS_VERSION,
        Command::Connect as u8,
        RESERVED,
        target.address_type() as u8,
    ];

    match target {
        TargetAddress::Ip(IpAddr::V4(ip)) => request.extend_from_slice(&ip.octets()),
        TargetAddress::Ip(IpAddr::V6(ip)) => request.extend_from_slice(&ip.octets()),
        TargetAddress::Domain(domain) => {
            let bytes = domain.as_bytes();
            let len = u8::try_from(bytes.len()).map_err(|_| HandshakeError::UnknownError)?;
            request.push(len);
            request.extend_from_slice(bytes);
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Total reply length implied by the bytes received so far, once enough of
/// the header is present to know it. An unknown address type ends the read
/// immediately; validation rejects it afterwards.
pub(crate) fn expected_reply_len(received: &[u8]) -> Option<usize> {
    if received.len() < 4 {
        return None;
    }

    match AddressType::from_byte(received[3]) {
        Some(AddressType::IPv4) => Some(10),
        Some(AddressType::IPv6) => Some(22),
        Some(AddressType::Domain) => received.get(4).map(|len| 7 + *len as usize),
        None => Some(received.len()),
    }
}

/// Validate a complete CONNECT reply
pub fn parse_connect_reply(reply: &[u8]) -> Result<(), HandshakeError> {
    if reply.len() < MIN_REPLY_LEN {
        return Err(HandshakeError::InvalidProxyResponse);
    }
    if reply[0] != SOCKS_VERSION {
        return Err(HandshakeError::InvalidProxyResponse);
    }
    if reply[1] != 0x00 {
        return Err(match ReplyCode::from_byte(reply[1]) {
            Some(code) => HandshakeError::Rejected(code),
            None => HandshakeError::InvalidProxyResponse,
        });
    }
    if reply[2] != RESERVED {
        return Err(HandshakeError::InvalidProxyResponse);
    }

    let expected = match AddressType::from_byte(reply[3]) {
        Some(AddressType::IPv4) => 10,
        Some(AddressType::IPv6) => 22,
        Some(AddressType::Domain) => 7 + reply[4] as usize,
        None => return Err(HandshakeError::InvalidProxyResponse),
    };

    if reply.len() != expected {
        return Err(HandshakeError::InvalidProxyResponse);
    }

    Ok(())
}
