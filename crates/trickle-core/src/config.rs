//! Configuration system for trickle.
//!
//! Resolution order: environment variables → config file → defaults.
//! The rate given on the command line overrides all three.
//!
//! Config file location:
//!   1. $TRICKLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trickle/config.toml
//!   3. ~/.config/trickle/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::rate::RateLimit;

/// Bytes a response head may add on top of one file chunk in a single write.
const HEADER_ALLOWANCE: u64 = 1024;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrickleConfig {
    pub throttle: ThrottleConfig,
    pub network: NetworkConfig,
    pub serve: ServeConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Aggregate outbound rate shared by all connections.
    pub bytes_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// TCP port. 0 = OS-assigned.
    pub port: u16,
    /// How long a peer is assumed to wait on a silent socket. Also used as
    /// the request header read timeout.
    pub socket_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Directory whose files are served. Empty = current directory.
    pub document_root: PathBuf,
    /// Bytes read from a file per body chunk; bounds the size of one paced write.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight connections may keep running after stop.
    pub grace_period_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TrickleConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            network: NetworkConfig::default(),
            serve: ServeConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 100_000.0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            socket_timeout_secs: 60,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            document_root: PathBuf::new(),
            chunk_size: 64 * 1024,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trickle")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rate must be a positive number of bytes per second, got {0}")]
    InvalidRate(f64),
    #[error("rate must be a positive integer, got {0:?}")]
    InvalidRateText(String),
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("socket timeout must be greater than zero")]
    InvalidSocketTimeout,
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Pacing headroom ───────────────────────────────────────────────────────────

/// Worst-case wait for a single paced write versus the socket timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingHeadroom {
    pub max_write_bytes: u64,
    pub max_write_delay: Duration,
    pub socket_timeout: Duration,
}

impl PacingHeadroom {
    /// A peer waiting on one paced write would give up before it completes.
    pub fn exceeds_timeout(&self) -> bool {
        self.max_write_delay > self.socket_timeout
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TrickleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            TrickleConfig::default()
        };
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRICKLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply TRICKLE_* overrides. Unparseable values are ignored.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, val) in vars {
            let val = val.as_ref();
            match key.as_ref() {
                "TRICKLE_THROTTLE__BYTES_PER_SECOND" => {
                    if let Ok(v) = val.parse() {
                        self.throttle.bytes_per_second = v;
                    }
                }
                "TRICKLE_NETWORK__HOST" => self.network.host = val.to_string(),
                "TRICKLE_NETWORK__PORT" => {
                    if let Ok(v) = val.parse() {
                        self.network.port = v;
                    }
                }
                "TRICKLE_NETWORK__SOCKET_TIMEOUT_SECS" => {
                    if let Ok(v) = val.parse() {
                        self.network.socket_timeout_secs = v;
                    }
                }
                "TRICKLE_SERVE__DOCUMENT_ROOT" => self.serve.document_root = PathBuf::from(val),
                "TRICKLE_SERVE__CHUNK_SIZE" => {
                    if let Ok(v) = val.parse() {
                        self.serve.chunk_size = v;
                    }
                }
                "TRICKLE_SHUTDOWN__GRACE_PERIOD_MS" => {
                    if let Ok(v) = val.parse() {
                        self.shutdown.grace_period_ms = v;
                    }
                }
                _ => {}
            }
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate()?;
        if self.serve.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.network.socket_timeout_secs == 0 {
            return Err(ConfigError::InvalidSocketTimeout);
        }
        Ok(())
    }

    pub fn rate(&self) -> Result<RateLimit, ConfigError> {
        RateLimit::new(self.throttle.bytes_per_second)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.network.socket_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    /// Directory to serve, falling back to the working directory.
    pub fn document_root(&self) -> PathBuf {
        if self.serve.document_root.as_os_str().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            self.serve.document_root.clone()
        }
    }

    /// The longest single write a connection produces is one file chunk or
    /// one response head, never several chunks coalesced; bounded here by
    /// chunk plus head. At the configured rate it must finish before the
    /// peer's socket timeout.
    pub fn pacing_headroom(&self) -> Result<PacingHeadroom, ConfigError> {
        let rate = self.rate()?;
        let max_write_bytes = self.serve.chunk_size as u64 + HEADER_ALLOWANCE;
        Ok(PacingHeadroom {
            max_write_bytes,
            max_write_delay: rate.duration_for(max_write_bytes),
            socket_timeout: self.socket_timeout(),
        })
    }
}
