//! Configuration types for the gateway
//!
//! Loaded from YAML (every field has a default, so an empty document is a
//! valid configuration) and shared read-only across tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::Instrument;
use crate::error::AppError;

/// Default HTTP listen port
pub const DEFAULT_PORT: u16 = 3000;

// ============================================================================
// Feed Configuration
// ============================================================================

/// Price/kline feed settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriceFeedConfig {
    /// Base URL of the kline REST API (e.g., "https://api.binance.com")
    pub base_url: String,
    /// Candle width requested from the API (e.g., "1m")
    pub kline_interval: String,
    /// Polling period in milliseconds
    pub interval_ms: u64,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            kline_interval: "1m".to_string(),
            interval_ms: 5_000,
        }
    }
}

/// Wallet balance feed settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalanceFeedConfig {
    /// Solana JSON-RPC endpoint
    pub rpc_url: String,
    /// Base58 wallet addresses to track
    pub wallets: Vec<String>,
    /// Polling period in milliseconds
    pub interval_ms: u64,
}

impl Default for BalanceFeedConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            wallets: Vec::new(),
            interval_ms: 30_000,
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP/WS listen port
    pub port: u16,
    /// Instruments polled and broadcast to subscribers
    pub instruments: Vec<Instrument>,
    /// Broadcast cadence in milliseconds
    pub broadcast_interval_ms: u64,
    /// Upper bound on a single upstream fetch
    pub fetch_timeout_ms: u64,
    /// Consecutive failed polls before a feed is reported stale
    pub stale_after_failures: u32,
    pub price_feed: PriceFeedConfig,
    pub balance_feed: BalanceFeedConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            instruments: vec![Instrument::Sol],
            broadcast_interval_ms: 1_000,
            fetch_timeout_ms: 5_000,
            stale_after_failures: 3,
            price_feed: PriceFeedConfig::default(),
            balance_feed: BalanceFeedConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Validate configuration rules
    pub fn validate(&self) -> Result<(), AppError> {
        if self.port == 0 {
            return Err(AppError::Config("port must be non-zero".to_string()));
        }

        if self.instruments.is_empty() {
            return Err(AppError::Config(
                "at least one instrument must be configured".to_string(),
            ));
        }

        for (name, value) in [
            ("broadcast_interval_ms", self.broadcast_interval_ms),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("price_feed.interval_ms", self.price_feed.interval_ms),
            ("balance_feed.interval_ms", self.balance_feed.interval_ms),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be > 0", name)));
            }
        }

        if self.stale_after_failures == 0 {
            return Err(AppError::Config(
                "stale_after_failures must be >= 1".to_string(),
            ));
        }

        if self.price_feed.base_url.trim().is_empty() {
            return Err(AppError::Config("price_feed.base_url cannot be empty".to_string()));
        }

        if self.balance_feed.rpc_url.trim().is_empty() {
            return Err(AppError::Config("balance_feed.rpc_url cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn price_interval(&self) -> Duration {
        Duration::from_millis(self.price_feed.interval_ms)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(self.balance_feed.interval_ms)
    }

    /// Age after which a price snapshot is reported stale
    pub fn max_snapshot_age_ms(&self) -> u64 {
        self.price_feed.interval_ms * u64::from(self.stale_after_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.instruments, vec![Instrument::Sol]);
        assert_eq!(config.broadcast_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = GatewayConfig {
            port: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port"), "Got: {}", err);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = GatewayConfig::default();
        config.price_feed.interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("price_feed.interval_ms"), "Got: {}", err);
    }

    #[test]
    fn test_empty_instruments_rejected() {
        let config = GatewayConfig {
            instruments: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_snapshot_age() {
        let config = GatewayConfig::default();
        // 3 missed polls at 5s
        assert_eq!(config.max_snapshot_age_ms(), 15_000);
    }
}
