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

//! Alert fan-out.
//!
//! One proximity alert is delivered to every registered [`AlertChannel`].
//! Channels are isolated from each other: a failure is logged and recorded
//! in the [`DispatchReport`] and the remaining channels still run.

mod channels;

use std::fmt;

use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;

use crate::model::Marker;

pub use channels::{
    AudioChannel, HapticChannel, NotificationChannel, NotificationOptions, NotificationSink,
    Permission, PopupChannel, PopupSink, TonePlayer, Vibrator, ALERT_TONE_DURATION,
    ALERT_TONE_HZ, POPUP_DISMISS_AFTER, VIBRATION_PATTERN_MS,
};

pub const ALERT_TITLE: &str = "Location Alert";

/// Errors raised by a single alert channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlertError {
    #[error("notification permission {0}")]
    Permission(Permission),

    #[error("{0} is not supported on this device")]
    Unsupported(&'static str),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// A single proximity alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub marker_id: String,
    pub marker_name: String,
    pub distance_m: f64,
    pub lat: f64,
    pub lng: f64,
    /// Stable per-marker tag; a newer alert replaces an older one with the same tag.
    pub tag: String,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    #[must_use]
    pub fn for_marker(marker: &Marker, distance_m: f64) -> Self {
        Self {
            marker_id: marker.id.clone(),
            marker_name: marker.name.clone(),
            distance_m,
            lat: marker.lat,
            lng: marker.lng,
            tag: marker.alert_tag(),
            title: ALERT_TITLE.to_string(),
            body: format!(
                "Approaching \"{}\", distance ~{}m",
                marker.name,
                distance_m.round()
            ),
            timestamp: Utc::now(),
        }
    }
}

/// A delivery channel for alerts.
///
/// `deliver` must not block for long; channels that do I/O hand it off to a
/// background task.
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<&'static str>,
    pub failed: Vec<(&'static str, AlertError)>,
}

impl DispatchReport {
    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delivers alerts to every registered channel.
#[derive(Default)]
pub struct AlertDispatcher {
    channels: Vec<Box<dyn AlertChannel>>,
}

impl fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl AlertDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl AlertChannel + 'static) -> Self {
        self.channels.push(Box::new(channel));
        self
    }

    pub fn add_channel(&mut self, channel: Box<dyn AlertChannel>) {
        self.channels.push(channel);
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Fire an alert for `marker` at `distance_m`. Never fails.
    pub fn fire_alert(&self, marker: &Marker, distance_m: f64) -> DispatchReport {
        let alert = Alert::for_marker(marker, distance_m);
        info!("Alert for marker '{}' ({}): {}", marker.name, marker.id, alert.body);

        let mut report = DispatchReport::default();
        for channel in &self.channels {
            match channel.deliver(&alert) {
                Ok(()) => report.delivered.push(channel.name()),
                Err(e) => {
                    warn!("Alert channel '{}' failed for marker {}: {}", channel.name(), marker.id, e);
                    report.failed.push((channel.name(), e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::{Alert, AlertChannel, AlertError};

    /// Channel that records every alert it receives.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingChannel {
        pub alerts: Arc<Mutex<Vec<Alert>>>,
    }

    impl RecordingChannel {
        pub(crate) fn count(&self) -> usize {
            self.alerts.lock().unwrap().len()
        }
    }

    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    pub(crate) struct FailingChannel;

    impl AlertChannel for FailingChannel {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn deliver(&self, _alert: &Alert) -> Result<(), AlertError> {
            Err(AlertError::Delivery("boom".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FailingChannel, RecordingChannel};
    use super::*;

    #[test]
    fn test_alert_content() {
        let marker = Marker::with_id("m1", "Old Tree", 25.0, 121.0, "g1");
        let alert = Alert::for_marker(&marker, 87.6);
        assert_eq!(alert.title, "Location Alert");
        assert_eq!(alert.body, "Approaching \"Old Tree\", distance ~88m");
        assert_eq!(alert.tag, "location-alert-m1");
    }

    #[test]
    fn test_failing_channel_does_not_block_others() {
        let recorder = RecordingChannel::default();
        let dispatcher = AlertDispatcher::new()
            .with_channel(FailingChannel)
            .with_channel(recorder.clone());

        let marker = Marker::with_id("m1", "Tree", 0.0, 0.0, "g1");
        let report = dispatcher.fire_alert(&marker, 10.0);

        assert_eq!(recorder.count(), 1);
        assert_eq!(report.delivered, vec!["recording"]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.all_delivered());
    }

    #[test]
    fn test_empty_dispatcher() {
        let marker = Marker::with_id("m1", "Tree", 0.0, 0.0, "g1");
        let report = AlertDispatcher::new().fire_alert(&marker, 10.0);
        assert!(report.all_delivered());
        assert!(report.delivered.is_empty());
    }
}
