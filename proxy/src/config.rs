//! Configuration file parser for l7proxify
//!
//! Supports l7proxify.yml with the listen address, logging options,
//! framing limits and the ordered hostname ruleset.

use anyhow::{Context, Result};
use l7proxify_shared::protocol::{Limits, MAX_CIPHERTEXT, MAX_HANDSHAKE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::{RuleEngine, RuleSpecs};

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the proxy accepts client connections on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Verify backend certificate chains before relaying them
    #[serde(default = "default_true")]
    pub verify_certificates: bool,

    /// Bound on the handshake inspection phase, 0 disables
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Optional address for the Prometheus endpoint
    pub metrics_listen: Option<SocketAddr>,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Hostname rules, evaluated in document order
    #[serde(default)]
    pub rules: RuleSpecs,

    /// `rules` compiled at parse time
    #[serde(skip)]
    engine: RuleEngine,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

/// TLS framing limits
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_max_ciphertext")]
    pub max_ciphertext: usize,
    #[serde(default = "default_max_handshake")]
    pub max_handshake: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ciphertext: MAX_CIPHERTEXT,
            max_handshake: MAX_HANDSHAKE,
        }
    }
}

impl From<&LimitsConfig> for Limits {
    fn from(cfg: &LimitsConfig) -> Self {
        Limits {
            max_ciphertext: cfg.max_ciphertext,
            max_handshake: cfg.max_handshake,
        }
    }
}

fn default_listen() -> String {
    "localhost:13131".to_string()
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_max_ciphertext() -> usize {
    MAX_CIPHERTEXT
}

fn default_max_handshake() -> usize {
    MAX_HANDSHAKE
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        config.engine = RuleEngine::load(&config.rules).context("Invalid ruleset")?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("Listen address cannot be empty");
        }
        match self.listen.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => anyhow::bail!("Invalid listen address '{}', expected host:port", self.listen),
        }

        if self.limits.max_ciphertext == 0 || self.limits.max_handshake == 0 {
            anyhow::bail!("Framing limits must be greater than zero");
        }

        Ok(())
    }

    /// Hand over the compiled ruleset, leaving an empty one behind.
    pub fn take_rule_engine(&mut self) -> RuleEngine {
        std::mem::take(&mut self.engine)
    }

    pub fn limits(&self) -> Limits {
        Limits::from(&self.limits)
    }

    /// Handshake deadline, `None` when disabled
    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("config/l7proxify.yml"),
            PathBuf::from("l7proxify.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".l7proxify").join("config.yml"));
        }
        candidates.push(PathBuf::from("/etc/l7proxify/config.yml"));

        candidates.into_iter().find(|path| path.exists())
    }
}
