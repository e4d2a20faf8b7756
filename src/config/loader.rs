//! Configuration loader for YAML files
//!
//! This module handles loading and validating configuration from YAML files,
//! then applying environment overrides.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::AppError;

use super::types::GatewayConfig;

/// Default configuration file, optional when not named explicitly
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Load configuration from a YAML file
///
/// This function:
/// 1. Checks if the file exists
/// 2. Parses the YAML content
/// 3. Validates the configuration rules
///
/// # Returns
/// * `Ok(GatewayConfig)` - Successfully loaded and validated configuration
/// * `Err(AppError)` - File not found, parse error, or validation failure
pub fn load_config(path: &Path) -> Result<GatewayConfig, AppError> {
    if !path.exists() {
        return Err(AppError::Config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let config: GatewayConfig = serde_yaml::from_reader(reader).map_err(|e| {
        AppError::Config(format!(
            "YAML parse error in '{}': {}",
            path.display(),
            e
        ))
    })?;

    config.validate()?;

    Ok(config)
}

/// Load configuration from a YAML string (useful for testing)
pub fn load_config_from_str(yaml_content: &str) -> Result<GatewayConfig, AppError> {
    let config: GatewayConfig = serde_yaml::from_str(yaml_content)
        .map_err(|e| AppError::Config(format!("YAML parse error: {}", e)))?;

    config.validate()?;

    Ok(config)
}

/// Resolve the process configuration
///
/// - `CONFIG_PATH` names the YAML file; if set, the file must exist.
/// - Without `CONFIG_PATH`, `config.yaml` is used when present, defaults otherwise.
/// - `PORT` overrides the listen port.
pub fn load_from_env() -> Result<GatewayConfig, AppError> {
    let mut config = match std::env::var("CONFIG_PATH") {
        Ok(path) => load_config(Path::new(&path))?,
        Err(_) => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_config(default_path)?
            } else {
                GatewayConfig::default()
            }
        }
    };

    if let Ok(port) = std::env::var("PORT") {
        config.port = port
            .parse()
            .map_err(|_| AppError::Config(format!("PORT is not a valid port number: {}", port)))?;
    }

    config.validate()?;

    Ok(config)
}

// ============================================================================
// Tests
// ============================================================================
