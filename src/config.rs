use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Config {
    pub fn trace_loaded(&self) {
        info!(
            base_url = %self.api.base_url,
            token_set = self.api.access_token.is_some(),
            printer_refresh_secs = self.fleet.printer_refresh_secs,
            status_tick_ms = self.fleet.status_tick_ms,
            "Loaded Config"
        );
        debug!(fleet = ?self.fleet, history = ?self.history, "Config loaded (full debug)");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Injected from the environment, never read from the file.
    #[serde(skip)]
    pub access_token: Option<String>,
}

/// Polling cadence of the fleet synchroniser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub printer_refresh_secs: u64,
    pub status_tick_ms: u64,
    /// Refetch interval for printing/paused printers.
    pub active_refresh_secs: u64,
    /// Refetch interval for every other printer.
    pub idle_refresh_secs: u64,
    pub command_poll_interval_ms: u64,
    pub command_poll_attempts: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            printer_refresh_secs: 5 * 60,
            status_tick_ms: 1000,
            active_refresh_secs: 4,
            idle_refresh_secs: 30,
            command_poll_interval_ms: 1000,
            command_poll_attempts: 8,
        }
    }
}

impl FleetConfig {
    pub fn printer_refresh(&self) -> Duration {
        Duration::from_secs(self.printer_refresh_secs)
    }

    pub fn status_tick(&self) -> Duration {
        Duration::from_millis(self.status_tick_ms)
    }

    pub fn active_refresh(&self) -> Duration {
        Duration::from_secs(self.active_refresh_secs)
    }

    pub fn idle_refresh(&self) -> Duration {
        Duration::from_secs(self.idle_refresh_secs)
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Job history polling interval; unset disables polling.
    pub refresh_secs: Option<u64>,
}

impl HistoryConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_secs.map(Duration::from_secs)
    }
}
