//! Configuration module for gateway settings and YAML loading
//!
//! This module provides:
//! - Configuration types (`GatewayConfig`, `PriceFeedConfig`, `BalanceFeedConfig`)
//! - YAML loading with environment overrides (`load_config`, `load_from_env`)
//! - Logging configuration (`init_logging`)

mod loader;
pub mod logging;
mod types;

// Re-export types
pub use types::{BalanceFeedConfig, GatewayConfig, PriceFeedConfig, DEFAULT_PORT};

// Re-export loader functions
pub use loader::{load_config, load_config_from_str, load_from_env, DEFAULT_CONFIG_PATH};

// Re-export logging functions
pub use logging::init_logging;
