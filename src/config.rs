// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading: defaults, optional TOML file, then environment.

use crate::error::ProxyError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PORT_SERVER: &str = "PORT_SERVER";
pub const ENV_HOST_SERVER: &str = "HOST_SERVER";
pub const ENV_CERT_FILE_TLS: &str = "CERT_FILE_TLS";
pub const ENV_KEY_FILE_TLS: &str = "KEY_FILE_TLS";
pub const ENV_MODE_TLS: &str = "MODE_TLS";
/// Seconds; every server and client timeout derives from it.
pub const ENV_BASIC_TIMEOUT: &str = "BASIC_TIMEOUT";

const MODE_ENABLE_TLS: &str = "ENABLE_TLS";

/// Multiple of the basic timeout allowed between requests on a connection.
const READ_TIMEOUT_FACTOR: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub basic_timeout_secs: u64,
    /// Largest response body buffered for a tunneled exchange.
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_basic_timeout_secs() -> u64 {
    10
}

/// Cap on a buffered tunneled response body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            basic_timeout_secs: default_basic_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve the listening socket itself over TLS.
    pub enabled: bool,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: PathBuf::from("localhost.crt"),
            ca_key_path: PathBuf::from("localhost.key"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
}

/// Timeouts derived from the basic timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Per outbound dispatch, plain or tunneled.
    pub upstream: Duration,
    /// Idle wait for the next request head on a client connection.
    pub read: Duration,
    pub write: Duration,
    pub handshake: Duration,
}

impl Timeouts {
    pub fn from_basic(basic: Duration) -> Self {
        Self {
            upstream: basic,
            read: basic * READ_TIMEOUT_FACTOR,
            write: basic,
            handshake: basic,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    ///
    /// ```toml
    /// [server]
    /// host = "localhost"
    /// port = 8081
    /// basic_timeout_secs = 10
    /// max_body_bytes = 67108864
    ///
    /// [tls]
    /// enabled = false
    /// ca_cert_path = "localhost.crt"
    /// ca_key_path = "localhost.key"
    /// ```
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overrides fields from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ProxyError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Overrides fields from `lookup`, keyed by the `ENV_*` names.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT_SERVER) {
            self.server.port = port.trim().parse().map_err(|e| {
                ProxyError::Config(format!("{ENV_PORT_SERVER}={port:?} is not a port: {e}"))
            })?;
        }
        if let Some(host) = lookup(ENV_HOST_SERVER) {
            self.server.host = host;
        }
        if let Some(path) = lookup(ENV_CERT_FILE_TLS) {
            self.tls.ca_cert_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_KEY_FILE_TLS) {
            self.tls.ca_key_path = PathBuf::from(path);
        }
        if let Some(mode) = lookup(ENV_MODE_TLS) {
            self.tls.enabled = mode.trim() == MODE_ENABLE_TLS;
        }
        if let Some(secs) = lookup(ENV_BASIC_TIMEOUT) {
            self.server.basic_timeout_secs = secs.trim().parse().map_err(|e| {
                ProxyError::Config(format!(
                    "{ENV_BASIC_TIMEOUT}={secs:?} is not a number of seconds: {e}"
                ))
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.server.basic_timeout_secs == 0 {
            return Err(ProxyError::Config("basic timeout must be positive".into()));
        }
        if self.server.max_body_bytes == 0 {
            return Err(ProxyError::Config("max body size must be positive".into()));
        }
        if self.server.host.trim().is_empty() {
            return Err(ProxyError::Config("server host is empty".into()));
        }
        Ok(())
    }

    pub fn basic_timeout(&self) -> Duration {
        Duration::from_secs(self.server.basic_timeout_secs)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_basic(self.basic_timeout())
    }

    /// `host:port` as accepted by `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        if self.server.host.contains(':') && !self.server.host.starts_with('[') {
            format!("[{}]:{}", self.server.host, self.server.port)
        } else {
            format!("{}:{}", self.server.host, self.server.port)
        }
    }
}
