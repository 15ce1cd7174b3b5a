//! Tunables of the credential lifecycle.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CastkeeperError;
use crate::model::Platform;

const MAX_SAFETY_BUFFER_MINUTES: i64 = 24 * 60;
const MAX_WARNING_THRESHOLD_DAYS: i64 = 365;
const MAX_SWEEP_INTERVAL_HOURS: u64 = 24 * 365;
const MAX_PROVIDER_TIMEOUT_SECONDS: u64 = 10 * 60;

/// Lifecycle settings, deserialized from the `[lifecycle]` table of the
/// daemon configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Tokens count as expired this many minutes before their real expiry.
    pub safety_buffer_minutes: i64,

    /// Credentials expiring within this many days are renewed by the sweep.
    pub warning_threshold_days: i64,

    /// Hours between two health-check sweeps.
    pub sweep_interval_hours: u64,

    /// Upper bound on a single provider call.
    pub provider_timeout_seconds: u64,

    /// App route where the user reconnects a platform.
    pub notification_action_path: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            safety_buffer_minutes: crate::cache::SAFETY_BUFFER_MINUTES,
            warning_threshold_days: 7,
            sweep_interval_hours: 24,
            provider_timeout_seconds: 30,
            notification_action_path: "/settings/connections".to_string(),
        }
    }
}

impl LifecycleSettings {
    pub fn safety_buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.safety_buffer_minutes.clamp(0, MAX_SAFETY_BUFFER_MINUTES))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours.min(MAX_SWEEP_INTERVAL_HOURS) * 60 * 60)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    /// Deep link to the reconnect screen for `platform`.
    pub fn reconnect_path(&self, platform: &Platform) -> String {
        format!("{}?platform={}", self.notification_action_path, platform)
    }

    pub fn validate(&self) -> Result<(), CastkeeperError> {
        if !(0..=MAX_SAFETY_BUFFER_MINUTES).contains(&self.safety_buffer_minutes) {
            return Err(out_of_range("safety_buffer_minutes", 0, MAX_SAFETY_BUFFER_MINUTES));
        }
        if !(0..=MAX_WARNING_THRESHOLD_DAYS).contains(&self.warning_threshold_days) {
            return Err(out_of_range("warning_threshold_days", 0, MAX_WARNING_THRESHOLD_DAYS));
        }
        if !(1..=MAX_SWEEP_INTERVAL_HOURS).contains(&self.sweep_interval_hours) {
            return Err(out_of_range("sweep_interval_hours", 1, MAX_SWEEP_INTERVAL_HOURS));
        }
        if !(1..=MAX_PROVIDER_TIMEOUT_SECONDS).contains(&self.provider_timeout_seconds) {
            return Err(out_of_range("provider_timeout_seconds", 1, MAX_PROVIDER_TIMEOUT_SECONDS));
        }
        Ok(())
    }
}

fn out_of_range(
    field: &str,
    min: impl std::fmt::Display,
    max: impl std::fmt::Display,
) -> CastkeeperError {
    CastkeeperError::Config {
        message: format!("{} must be between {} and {}", field, min, max),
    }
}
