//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Longest username or password RFC 1929 can carry.
pub const MAX_CREDENTIAL_LEN: usize = 255;

/// Bridge configuration as supplied by the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// SOCKS5 server hostname or IP address
    pub socks5_host: String,

    /// SOCKS5 server port
    pub socks5_port: u16,

    /// Username for RFC 1929 authentication
    pub username: Option<String>,

    /// Password for RFC 1929 authentication
    pub password: Option<String>,

    /// Resolve target hostnames here instead of on the SOCKS5 server
    pub resolve_hostnames_locally: bool,

    /// Local HTTP proxy port, 0 for an ephemeral port
    pub listen_port: u16,

    /// Logging level
    pub log_level: String,

    /// Timeout settings
    pub timeouts: TimeoutConfig,
}

/// Optional timeouts. Unset means wait forever, and the relay phase is
/// never bounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit on reading the client's request header block
    pub header_read_secs: Option<u64>,

    /// Limit on connecting to and negotiating with the SOCKS5 server
    pub handshake_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn header_read(&self) -> Option<Duration> {
        self.header_read_secs.map(Duration::from_secs)
    }

    pub fn handshake(&self) -> Option<Duration> {
        self.handshake_secs.map(Duration::from_secs)
    }
}

/// Username/password pair offered to the SOCKS5 server
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolved upstream settings, built once at startup and shared read-only
/// by every connection.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// SOCKS5 server address
    pub address: SocketAddr,

    /// Credentials, if username/password authentication should be offered
    pub credentials: Option<Credentials>,

    /// Resolve target hostnames before sending the CONNECT request
    pub resolve_locally: bool,

    /// Bound on connect plus negotiation
    pub handshake_timeout: Option<Duration>,
}

impl UpstreamConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            credentials: None,
            resolve_locally: false,
            handshake_timeout: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_local_resolution(mut self, enabled: bool) -> Self {
        self.resolve_locally = enabled;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socks5_host: "127.0.0.1".to_string(),
            socks5_port: 1080,
            username: None,
            password: None,
            resolve_hostnames_locally: false,
            listen_port: 8118,
            log_level: "info".to_string(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Check the configuration for values the bridge cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.socks5_host.trim().is_empty() {
            return Err(crate::ProxyError::config("SOCKS5 host must not be empty"));
        }

        match (&self.username, &self.password) {
            (None, None) => Ok(()),
            (Some(username), Some(password)) => {
                if username.is_empty() {
                    return Err(crate::ProxyError::config("username must not be empty"));
                }
                if password.is_empty() {
                    return Err(crate::ProxyError::config("password must not be empty"));
                }
                if username.len() > MAX_CREDENTIAL_LEN || password.len() > MAX_CREDENTIAL_LEN {
                    return Err(crate::ProxyError::config(format!(
                        "username and password are limited to {} bytes",
                        MAX_CREDENTIAL_LEN
                    )));
                }
                Ok(())
            }
            _ => Err(crate::ProxyError::config(
                "username and password must be given together",
            )),
        }
    }

    /// Validate and resolve the SOCKS5 server address.
    ///
    /// A hostname is looked up once here and the first address is kept for
    /// the lifetime of the process.
    pub async fn resolve(&self) -> crate::Result<Arc<UpstreamConfig>> {
        self.validate()?;

        let host = self.socks5_host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let address = tokio::net::lookup_host((host, self.socks5_port))
            .await
            .map_err(|e| {
                crate::ProxyError::config(format!("Failed to resolve {}: {}", self.socks5_host, e))
            })?
            .next()
            .ok_or_else(|| {
                crate::ProxyError::config(format!("No address found for {}", self.socks5_host))
            })?;

        debug!("SOCKS5 server {} resolved to {}", self.socks5_host, address);

        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        Ok(Arc::new(UpstreamConfig {
            address,
            credentials,
            resolve_locally: self.resolve_hostnames_locally,
            handshake_timeout: self.timeouts.handshake(),
        }))
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content)
            .map_err(|e| crate::ProxyError::config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::ProxyError::config(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
