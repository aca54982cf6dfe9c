use crate::config::Config;
use std::fs;
use std::path::Path;
use anyhow::Result;
use tracing::{info, warn, error};

/// Environment variable holding the Spark access token.
pub const ACCESS_TOKEN_VAR: &str = "SPARK_ACCESS_TOKEN";

/// Loads the static YAML config file (no secrets) and injects the access token from the
/// environment. A missing token is not an error: the synchroniser simply stays idle.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: Config = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if config.fleet.command_poll_attempts == 0 {
        error!("fleet.command_poll_attempts must be at least 1");
        anyhow::bail!("fleet.command_poll_attempts must be at least 1");
    }
    if config.fleet.status_tick_ms == 0 || config.fleet.printer_refresh_secs == 0 {
        error!(fleet = ?config.fleet, "Fleet polling intervals must be non-zero");
        anyhow::bail!("fleet.status_tick_ms and fleet.printer_refresh_secs must be non-zero");
    }

    config.api.access_token = match std::env::var(ACCESS_TOKEN_VAR) {
        Ok(token) if !token.is_empty() => {
            info!("{ACCESS_TOKEN_VAR} found in env");
            Some(token)
        }
        _ => {
            warn!("{ACCESS_TOKEN_VAR} not set; fleet polling stays idle");
            None
        }
    };

    config.trace_loaded();
    Ok(config)
}
