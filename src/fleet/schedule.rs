//! When to refetch a printer's status.
//!
//! The status tick runs every second but only printers that are due are fetched:
//! active printers (printing or paused) every `active_interval`, everything else every
//! `idle_interval`. Between fetches a printing printer's time remaining is counted down
//! locally so progress moves smoothly.

use std::time::Duration;

use crate::config::FleetConfig;
use crate::contract::PrinterStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    Fetch,
    /// Not due; decrement the cached seconds-left.
    CountDown,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub active_interval: Duration,
    pub idle_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(4),
            idle_interval: Duration::from_secs(30),
        }
    }
}

impl From<&FleetConfig> for RefreshPolicy {
    fn from(config: &FleetConfig) -> Self {
        Self {
            active_interval: config.active_refresh(),
            idle_interval: config.idle_refresh(),
        }
    }
}

impl RefreshPolicy {
    /// `elapsed` is `None` for a printer that has never been fetched.
    pub fn decide(
        &self,
        status: Option<&PrinterStatus>,
        elapsed: Option<Duration>,
    ) -> RefreshDecision {
        let Some(elapsed) = elapsed else {
            return RefreshDecision::Fetch;
        };
        let active = status.is_some_and(PrinterStatus::is_active);

        if (active && elapsed >= self.active_interval) || elapsed >= self.idle_interval {
            RefreshDecision::Fetch
        } else if status.is_some_and(PrinterStatus::is_printing) {
            RefreshDecision::CountDown
        } else {
            RefreshDecision::Idle
        }
    }
}
