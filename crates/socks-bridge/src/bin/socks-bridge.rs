//! socks-bridge: local HTTP proxy in front of a SOCKS5 server

use anyhow::{Context, Result};
use clap::Parser;
use socks_bridge::{BridgeConfig, ProxyServer};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "socks-bridge")]
#[command(about = "HTTP proxy that tunnels every request through a SOCKS5 server")]
#[command(version)]
struct Cli {
    /// SOCKS5 server hostname or IP address
    #[arg(value_name = "SOCKS5_HOST", default_value = "127.0.0.1", conflicts_with = "config")]
    socks5_host: String,

    /// SOCKS5 server port
    #[arg(value_name = "SOCKS5_PORT", default_value_t = 1080, conflicts_with = "config")]
    socks5_port: u16,

    /// Local HTTP proxy port
    #[arg(value_name = "HTTP_PORT", default_value_t = 8118, conflicts_with = "config")]
    http_port: u16,

    /// Username for SOCKS5 authentication
    #[arg(short, long, requires = "password", conflicts_with = "config")]
    username: Option<String>,

    /// Password for SOCKS5 authentication
    #[arg(short, long, requires = "username", conflicts_with = "config")]
    password: Option<String>,

    /// Resolve target hostnames locally instead of on the SOCKS5 server
    #[arg(long, conflicts_with = "config")]
    resolve_locally: bool,

    /// Read settings from a TOML file instead of the arguments above;
    /// only the timeout and logging flags may be combined with it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Give up on clients that do not send a full request header in time
    #[arg(long, value_name = "SECS")]
    header_timeout: Option<u64>,

    /// Give up on SOCKS5 connect and negotiation after this long
    #[arg(long, value_name = "SECS")]
    handshake_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Disable logging
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    async fn into_config(self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load_from_file(path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => BridgeConfig {
                socks5_host: self.socks5_host,
                socks5_port: self.socks5_port,
                username: self.username,
                password: self.password,
                resolve_hostnames_locally: self.resolve_locally,
                listen_port: self.http_port,
                ..BridgeConfig::default()
            },
        };

        if self.header_timeout.is_some() {
            config.timeouts.header_read_secs = self.header_timeout;
        }
        if self.handshake_timeout.is_some() {
            config.timeouts.handshake_secs = self.handshake_timeout;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (verbose, quiet) = (cli.verbose, cli.quiet);

    let config = cli.into_config().await?;
    setup_logging(&config.log_level, verbose, quiet);

    let server = ProxyServer::from_config(&config)
        .await
        .context("Failed to start HTTP proxy")?;

    info!(
        "Forwarding through SOCKS5 server {}:{}",
        config.socks5_host, config.socks5_port
    );
    info!("Configure HTTP clients with proxy {}", server.proxy_uri()?);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Proxy stopped: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

fn setup_logging(level: &str, verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    if quiet {
        return;
    }

    let level = if verbose { "debug" } else { level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
