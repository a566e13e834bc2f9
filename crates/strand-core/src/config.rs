//! Configuration system for Strand.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STRAND_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/strand/config.toml
//!   3. ~/.config/strand/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the render endpoint.
    pub endpoint: String,
    /// Stream media type sent in Accept. Empty = built-in default.
    pub media_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplicative backoff factor.
    pub backoff_factor: f64,
    /// Total request attempts, including the first.
    pub max_attempts: u32,
    /// Server Retry-After hints above this are not honored; the response
    /// is returned as-is and the caller treats it as a failure.
    pub retry_after_ceiling_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identification string sent upstream and matched against
    /// `buffered_fetch_agents`.
    pub user_agent: String,
    /// Force the buffering-request fallback regardless of user agent.
    pub force_buffered_fetch: bool,
    /// User-agent substrings whose streaming body primitive is known to be
    /// unreliable. Matching clients buffer the full body before exposing it.
    pub buffered_fetch_agents: Vec<String>,
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn retry_after_ceiling(&self) -> Duration {
        Duration::from_secs(self.retry_after_ceiling_secs)
    }

    /// Backoff delay before retry number `attempt` (1-based: the delay
    /// after the first failed request is `delay_before(1)`).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.initial_delay_ms as f64 * factor) as u64)
    }
}

impl ClientConfig {
    /// Buffering fallback is keyed off client identification, not feature
    /// probing.
    pub fn needs_buffered_fetch(&self) -> bool {
        self.force_buffered_fetch
            || self
                .buffered_fetch_agents
                .iter()
                .any(|pat| self.user_agent.contains(pat.as_str()))
    }
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for StrandConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            retry: RetryConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            media_type: String::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_attempts: 3,
            retry_after_ceiling_secs: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("strand/{}", env!("CARGO_PKG_VERSION")),
            force_buffered_fetch: false,
            buffered_fetch_agents: Vec::new(),
        }
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("strand")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl StrandConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StrandConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STRAND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StrandConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply STRAND_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STRAND_TRANSPORT__ENDPOINT") {
            self.transport.endpoint = v;
        }
        if let Ok(v) = std::env::var("STRAND_RETRY__MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("STRAND_RETRY__INITIAL_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.retry.initial_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("STRAND_CLIENT__FORCE_BUFFERED_FETCH") {
            self.client.force_buffered_fetch = v == "true" || v == "1";
        }
    }
}
