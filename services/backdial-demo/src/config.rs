//! Demo configuration (env-driven).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which side(s) of the transport this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dial out to `addr` and serve health checks.
    Server,
    /// Listen on `addr` and health-check whoever dials in.
    Client,
    /// Both in one process: the server role dials the local client.
    Both,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            "both" => Ok(Mode::Both),
            other => bail!("unknown mode '{other}' (expected server, client or both)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,

    /// Client listen address, or the address the server role dials.
    pub addr: String,

    /// Identifier the server role announces.
    pub peer_id: String,

    /// Parse PROXY v1/v2 headers on accepted sockets.
    pub proxy_protocol: bool,

    pub dial_timeout: Duration,

    /// Interval between health-check rounds on the client role.
    pub check_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mode = std::env::var("BACKDIAL_MODE")
            .unwrap_or_else(|_| "both".to_string())
            .parse()
            .context("BACKDIAL_MODE is invalid.")?;

        let addr =
            std::env::var("BACKDIAL_ADDR").unwrap_or_else(|_| "127.0.0.1:50052".to_string());

        let peer_id = std::env::var("BACKDIAL_PEER_ID").unwrap_or_else(|_| "demo-edge".to_string());
        if peer_id.is_empty() || peer_id.len() > backdial::MAX_ID_LEN {
            bail!(
                "BACKDIAL_PEER_ID must be 1 to {} bytes long.",
                backdial::MAX_ID_LEN
            );
        }

        let proxy_protocol = std::env::var("BACKDIAL_PROXY_PROTOCOL")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let dial_timeout_ms: u64 = std::env::var("BACKDIAL_DIAL_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BACKDIAL_DIAL_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(3000);

        let check_interval_ms: u64 = std::env::var("BACKDIAL_CHECK_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BACKDIAL_CHECK_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let log_level = std::env::var("BACKDIAL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            mode,
            addr,
            peer_id,
            proxy_protocol,
            dial_timeout: Duration::from_millis(dial_timeout_ms.max(100)),
            check_interval: Duration::from_millis(check_interval_ms.max(100)),
            log_level,
        })
    }
}
