//! Runtime tunables for the nearby ranging core
//!
//! Loading from disk is left to the host application; it hands partial JSON
//! objects to [`NearbyConfig::update_from_json`].

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// All tunables, grouped by component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NearbyConfig {
    pub connection: ConnectionSettings,
    pub ranging: RangingSettings,
    pub filter: FilterSettings,
    pub registry: RegistrySettings,
}

/// Invitation, connection limit and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub invite_timeout_secs: u64,
    pub max_connections: usize,
    pub max_attempts: u32,
    pub retry_cooldown_secs: u64,
    pub retry_jitter_ms: u64,
}

/// Session lifecycle and token exchange timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangingSettings {
    /// Pause between two consecutive engine configuration calls
    pub settle_interval_ms: u64,
    pub recreate_backoff_ms: u64,
    pub max_recreate_attempts: u32,
    /// How long a session outlives its channel before teardown
    pub session_grace_ms: u64,
    pub token_retry_delay_ms: u64,
    pub max_token_retries: u32,
    pub max_send_attempts: u32,
}

/// Process/measurement noise pair for one filter channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseTuning {
    pub q: f64,
    pub r: f64,
}

/// Signal filter tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub distance: NoiseTuning,
    pub direction: NoiseTuning,
    pub bearing: NoiseTuning,
    /// Jump larger than this fraction of the smoothed distance is treated as suspect
    pub distance_jump_ratio: f64,
    pub distance_nudge: f64,
    pub bearing_jump_degrees: f64,
    pub bearing_nudge: f64,
}

/// Device registry staleness policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub inactivity_timeout_secs: u64,
    pub eviction_interval_secs: u64,
    pub update_buffer: usize,
}

impl NearbyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merge a (possibly partial) JSON object into the current configuration
    pub fn update_from_json(&mut self, json: Value) -> Result<()> {
        if !json.is_object() {
            bail!("Configuration update must be a JSON object");
        }

        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, json);

        let updated: NearbyConfig = serde_json::from_value(current)?;
        updated.validate()?;
        *self = updated;

        log::info!("Configuration updated");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.connection.invite_timeout_secs == 0 {
            bail!("invite_timeout_secs must be greater than 0");
        }

        for (name, tuning) in [
            ("distance", self.filter.distance),
            ("direction", self.filter.direction),
            ("bearing", self.filter.bearing),
        ] {
            if tuning.q < 0.0 || tuning.r <= 0.0 {
                bail!("{} filter needs q >= 0 and r > 0", name);
            }
        }

        for (name, fraction) in [
            ("distance_nudge", self.filter.distance_nudge),
            ("bearing_nudge", self.filter.bearing_nudge),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                bail!("{} must be within [0, 1]", name);
            }
        }

        if self.registry.eviction_interval_secs == 0 {
            bail!("eviction_interval_secs must be greater than 0");
        }

        Ok(())
    }
}

impl ConnectionSettings {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }
}

impl RangingSettings {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn recreate_backoff(&self) -> Duration {
        Duration::from_millis(self.recreate_backoff_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    pub fn token_retry_delay(&self) -> Duration {
        Duration::from_millis(self.token_retry_delay_ms)
    }
}

impl RegistrySettings {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            invite_timeout_secs: 15,
            max_connections: 8,
            max_attempts: 3,
            retry_cooldown_secs: 5,
            retry_jitter_ms: 500,
        }
    }
}

impl Default for RangingSettings {
    fn default() -> Self {
        Self {
            settle_interval_ms: 1000,
            recreate_backoff_ms: 2000,
            max_recreate_attempts: 3,
            session_grace_ms: 2000,
            token_retry_delay_ms: 500,
            max_token_retries: 10,
            max_send_attempts: 3,
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            distance: NoiseTuning { q: 0.1, r: 0.2 },
            direction: NoiseTuning { q: 0.01, r: 0.3 },
            bearing: NoiseTuning { q: 0.01, r: 0.1 },
            distance_jump_ratio: 0.5,
            distance_nudge: 0.3,
            bearing_jump_degrees: 3.0,
            bearing_nudge: 0.1,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 60,
            eviction_interval_secs: 15,
            update_buffer: 256,
        }
    }
}

fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
