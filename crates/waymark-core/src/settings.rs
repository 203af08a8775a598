// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-tunable alert and location settings.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::position::WatchOptions;

/// A setting outside its allowed range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("{field} must be at least 1 {unit}")]
    TooSmall { field: &'static str, unit: &'static str },
}

pub const DEFAULT_ALERT_DISTANCE: u32 = 100;
pub const DEFAULT_ALERT_INTERVAL: u32 = 30;
const DEFAULT_UPDATE_FREQUENCY_MS: u64 = 3_000;
const DEFAULT_LOCATION_TIMEOUT_MS: u64 = 20_000;
const MAX_STALE_CAP_MS: u64 = 10_000;

/// Settings persisted alongside the map data.
///
/// Zero values read from storage are treated as missing and replaced with
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Alert radius in meters.
    #[serde(default = "default_alert_distance", deserialize_with = "nonzero_u32::<DEFAULT_ALERT_DISTANCE, _>")]
    pub alert_distance: u32,

    /// Repeat period while in range, in seconds.
    #[serde(default = "default_alert_interval", deserialize_with = "nonzero_u32::<DEFAULT_ALERT_INTERVAL, _>")]
    pub alert_interval: u32,

    #[serde(default = "default_true")]
    pub enable_notifications: bool,

    #[serde(default = "default_true")]
    pub enable_high_accuracy: bool,

    #[serde(default)]
    pub auto_start_tracking: bool,

    #[serde(default = "default_update_frequency", deserialize_with = "nonzero_u64::<DEFAULT_UPDATE_FREQUENCY_MS, _>")]
    pub location_update_frequency_ms: u64,

    #[serde(default = "default_location_timeout", deserialize_with = "nonzero_u64::<DEFAULT_LOCATION_TIMEOUT_MS, _>")]
    pub location_timeout_ms: u64,
}

fn default_alert_distance() -> u32 {
    DEFAULT_ALERT_DISTANCE
}

fn default_alert_interval() -> u32 {
    DEFAULT_ALERT_INTERVAL
}

fn default_true() -> bool {
    true
}

fn default_update_frequency() -> u64 {
    DEFAULT_UPDATE_FREQUENCY_MS
}

fn default_location_timeout() -> u64 {
    DEFAULT_LOCATION_TIMEOUT_MS
}

fn nonzero_u32<'de, const DEFAULT: u32, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let value = Option::<u32>::deserialize(d)?;
    Ok(value.filter(|v| *v > 0).unwrap_or(DEFAULT))
}

fn nonzero_u64<'de, const DEFAULT: u64, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let value = Option::<u64>::deserialize(d)?;
    Ok(value.filter(|v| *v > 0).unwrap_or(DEFAULT))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            alert_distance: DEFAULT_ALERT_DISTANCE,
            alert_interval: DEFAULT_ALERT_INTERVAL,
            enable_notifications: true,
            enable_high_accuracy: true,
            auto_start_tracking: false,
            location_update_frequency_ms: DEFAULT_UPDATE_FREQUENCY_MS,
            location_timeout_ms: DEFAULT_LOCATION_TIMEOUT_MS,
        }
    }
}

impl Settings {
    /// Reject values that would disable alerting or spin the timer.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let too_small = |field: &'static str, unit: &'static str| -> Result<(), SettingsError> {
            Err(SettingsError::TooSmall { field, unit })
        };
        if self.alert_distance < 1 {
            return too_small("alert distance", "meter");
        }
        if self.alert_interval < 1 {
            return too_small("alert interval", "second");
        }
        if self.location_update_frequency_ms < 1 {
            return too_small("location update frequency", "ms");
        }
        if self.location_timeout_ms < 1 {
            return too_small("location timeout", "ms");
        }
        Ok(())
    }

    #[must_use]
    pub fn alert_distance_m(&self) -> f64 {
        f64::from(self.alert_distance)
    }

    #[must_use]
    pub fn alert_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.alert_interval))
    }

    /// Options handed to the location source.
    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions::from_millis(
            self.enable_high_accuracy,
            self.location_timeout_ms,
            self.location_update_frequency_ms.min(MAX_STALE_CAP_MS),
        )
    }
}
