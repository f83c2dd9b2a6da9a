//! Configuration tree loaded from TOML with per-environment defaults.
//!
//! Every section has serde defaults, so a minimal config file only names
//! what it overrides. Validation happens once at load; a malformed config
//! is a fatal startup error.

use crate::error::NodeError;
use meshbook_markets::Pair;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Deployment environment; affects defaults only.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Test,
}

/// Logger sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub directory: Option<PathBuf>,
    pub max_files: u32,
    pub max_size_mb: u64,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
            max_files: 5,
            max_size_mb: 50,
            json: false,
        }
    }
}

/// Exchange-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Pair bound at node startup.
    pub pair: String,
    /// Application listener port; also the P2P port when `p2p.port` is
    /// left at 0.
    pub port: u16,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            pair: "BTC/USD".into(),
            port: 4100,
        }
    }
}

/// Peer transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub host: String,
    /// 0 means unified with `exchange.port`.
    pub port: u16,
    pub bootstrap_peers: Vec<String>,
    pub enable_mdns: bool,
    pub enable_peer_exchange: bool,
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub peer_storage_path: Option<PathBuf>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 0,
            bootstrap_peers: vec![],
            enable_mdns: true,
            enable_peer_exchange: true,
            max_inbound: 50,
            max_outbound: 50,
            peer_storage_path: None,
        }
    }
}

/// Performance and input-bound settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Order placements slower than this are logged at WARN.
    pub threshold_ms: u64,
    pub max_order_amount: Decimal,
    pub max_order_price: Decimal,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            threshold_ms: 100,
            max_order_amount: Decimal::from(1_000_000),
            max_order_price: Decimal::from(100_000_000),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Rate limiting gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_rate_limit: bool,
    pub orders_per_minute: u32,
    pub requests_per_second: u32,
    pub messages_per_minute: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_rate_limit: true,
            orders_per_minute: 100,
            requests_per_second: 10,
            messages_per_minute: 1_000,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub log: LogConfig,
    pub exchange: ExchangeConfig,
    pub p2p: P2pConfig,
    pub performance: PerformanceConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub security: SecurityConfig,
}

impl Config {
    /// Defaults tuned per environment.
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Config {
            environment,
            ..Default::default()
        };
        match environment {
            Environment::Development => {
                config.log.level = "debug".into();
            }
            Environment::Staging => {}
            Environment::Production => {
                config.log.json = true;
            }
            Environment::Test => {
                config.security.enable_rate_limit = false;
                config.p2p.enable_mdns = false;
            }
        }
        config
    }

    /// Load and validate a TOML config file.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, NodeError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NodeError::fatal(format!("config {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| NodeError::fatal(format!("config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// The effective P2P listener port.
    pub fn p2p_port(&self) -> u16 {
        if self.p2p.port == 0 {
            self.exchange.port
        } else {
            self.p2p.port
        }
    }

    /// The pair this node's book is bound to.
    pub fn pair(&self) -> Result<Pair, NodeError> {
        self.exchange.pair.parse::<Pair>().map_err(NodeError::from)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if let Err(error) = self.pair() {
            return Err(NodeError::fatal(format!("exchange.pair: {}", error.message)));
        }
        if self.performance.max_order_amount <= Decimal::ZERO
            || self.performance.max_order_price <= Decimal::ZERO
        {
            return Err(NodeError::fatal("order bounds must be positive"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(NodeError::fatal("failure_threshold must be at least 1"));
        }
        if self.p2p.max_inbound == 0 && self.p2p.max_outbound == 0 {
            return Err(NodeError::fatal(
                "at least one connection direction must be allowed",
            ));
        }
        Ok(())
    }
}
