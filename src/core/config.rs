//! Configuration parsing and validation.
//!
//! Client configuration is loaded from TOML files or built in code. The
//! endpoint describes where (and as whom) to connect; the timeouts bound
//! every phase of connection establishment and steady-state health
//! checking. Transport establishment itself (resolve, connect, TLS) lives
//! outside the core, but its deadlines are configured here so callers deal
//! with one timeout surface.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server roles a client may assert after the handshake.
pub const KNOWN_ROLES: [&str; 2] = ["master", "replica"];

/// Where and as whom to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Server host name or address.
    pub host: String,

    /// Server port.
    pub port: String,

    /// Username for `HELLO ... AUTH`.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for `HELLO ... AUTH`.
    #[serde(default)]
    pub password: Option<String>,

    /// Expected server role; empty or absent disables the assertion.
    #[serde(default)]
    pub role: Option<String>,
}

impl Endpoint {
    /// Create an endpoint without credentials or role assertion.
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            username: None,
            password: None,
            role: None,
        }
    }

    /// Attach credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Assert a server role after the handshake.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Timeouts for connection establishment and health checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Name resolution deadline (consumed by external dialers).
    pub resolve: Duration,

    /// TCP connect deadline (consumed by external dialers).
    pub connect: Duration,

    /// TLS handshake deadline (consumed by external dialers).
    pub handshake: Duration,

    /// RESP3 HELLO exchange deadline.
    pub resp3_handshake: Duration,

    /// Health check pace; doubles as the idle-timeout unit.
    pub ping_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resolve: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            resp3_handshake: Duration::from_secs(2),
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// Serde-facing timeout section, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_resp3_handshake_timeout_ms")]
    pub resp3_handshake_timeout_ms: u64,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

fn default_resolve_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_resp3_handshake_timeout_ms() -> u64 {
    2_000
}

fn default_ping_interval_ms() -> u64 {
    1_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: default_resolve_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            resp3_handshake_timeout_ms: default_resp3_handshake_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl TimeoutsConfig {
    /// Convert to runtime durations.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            resolve: Duration::from_millis(self.resolve_timeout_ms),
            connect: Duration::from_millis(self.connect_timeout_ms),
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            resp3_handshake: Duration::from_millis(self.resp3_handshake_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection endpoint.
    pub endpoint: Endpoint,

    /// Timeout settings.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.host.is_empty() {
            anyhow::bail!("endpoint.host must not be empty");
        }
        if self.endpoint.port.is_empty() {
            anyhow::bail!("endpoint.port must not be empty");
        }
        if let Some(role) = self.endpoint.role.as_deref() {
            if !role.is_empty() && !KNOWN_ROLES.contains(&role) {
                anyhow::bail!("endpoint.role must be one of {:?}, got {:?}", KNOWN_ROLES, role);
            }
        }
        if self.timeouts.ping_interval_ms == 0 {
            anyhow::bail!("timeouts.ping_interval_ms must be greater than zero");
        }
        Ok(())
    }
}
