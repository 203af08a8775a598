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

//! Position tracking.
//!
//! A [`LocationSource`] produces raw fixes (or errors) on a channel; the
//! [`PositionTracker`] normalizes them into [`PositionRecord`]s, fills in a
//! speed when the source did not report one, and broadcasts every update
//! exactly once, in arrival order.

mod feed;
mod parse;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::geo::distance_meters;

pub use feed::{FeedConfig, FeedSource};
pub use parse::{parse_line, LineError};

/// Accuracy above which a fix is logged as poor.
const POOR_ACCURACY_METERS: f64 = 50.0;

/// Errors delivered alongside fixes. None of them end the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("location request timed out after {0:?}")]
    Timeout(Duration),
}

/// Raw fix as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub lat: f64,
    pub lng: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: Option<f64>,
    /// Ground speed in m/s, when the source measures it.
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Fix {
    #[must_use]
    pub fn at(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            accuracy: None,
            speed: None,
            timestamp,
        }
    }
}

/// Canonical position record published by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Speed in m/s; reported by the source or derived from the previous record.
    pub speed: Option<f64>,
}

impl PositionRecord {
    /// Normalize a fix, deriving speed from `prev` when the fix has none.
    #[must_use]
    pub fn from_fix(fix: Fix, prev: Option<&PositionRecord>) -> Self {
        let speed = fix.speed.or_else(|| {
            let prev = prev?;
            let elapsed_ms = (fix.timestamp - prev.timestamp).num_milliseconds();
            if elapsed_ms <= 0 {
                return None;
            }
            #[allow(clippy::cast_precision_loss, reason = "millisecond spans fit in f64")]
            let elapsed_secs = elapsed_ms as f64 / 1000.0;
            Some(distance_meters(prev.lat, prev.lng, fix.lat, fix.lng) / elapsed_secs)
        });

        Self {
            lat: fix.lat,
            lng: fix.lng,
            accuracy: fix.accuracy,
            timestamp: fix.timestamp,
            speed,
        }
    }

    /// Speed in km/h, for display.
    #[must_use]
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed.map(|s| s * 3.6)
    }
}

/// Options passed to a location source when watching starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// How long to wait for a fix before reporting [`LocationError::Timeout`].
    pub timeout: Duration,
    /// Oldest fix the source may still deliver.
    pub max_stale: Duration,
}

impl WatchOptions {
    #[must_use]
    pub fn from_millis(high_accuracy: bool, timeout_ms: u64, max_stale_ms: u64) -> Self {
        Self {
            high_accuracy,
            timeout: Duration::from_millis(timeout_ms),
            max_stale: Duration::from_millis(max_stale_ms),
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_millis(true, 20_000, 3_000)
    }
}

/// A continuous source of location fixes.
///
/// Implementations spawn their own task, push results into the returned
/// channel in arrival order and stop once `cancel` fires.
pub trait LocationSource: Send + Sync + fmt::Debug {
    fn watch(
        &self,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Fix, LocationError>>;
}

/// Source that replays a fixed list of results with a delay before each.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    steps: Vec<(Duration, Result<Fix, LocationError>)>,
}

impl ScriptedSource {
    #[must_use]
    pub fn new(steps: Vec<(Duration, Result<Fix, LocationError>)>) -> Self {
        Self { steps }
    }

    /// Replay fixes at a fixed cadence.
    #[must_use]
    pub fn every(step: Duration, fixes: Vec<Fix>) -> Self {
        Self::new(fixes.into_iter().map(|f| (step, Ok(f))).collect())
    }
}

impl LocationSource for ScriptedSource {
    fn watch(
        &self,
        _options: WatchOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Fix, LocationError>> {
        let (tx, rx) = mpsc::channel(self.steps.len().max(1));
        let steps = self.steps.clone();
        tokio::spawn(async move {
            for (delay, item) in steps {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return,
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

/// Update published by the tracker.
pub type PositionEvent = Result<PositionRecord, LocationError>;

/// Wraps a location source and publishes normalized position updates.
pub struct PositionTracker {
    source: Arc<dyn LocationSource>,
    latest: Arc<RwLock<Option<PositionRecord>>>,
    event_tx: broadcast::Sender<PositionEvent>,
    cancel_token: Option<CancellationToken>,
}

impl fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionTracker")
            .field("source", &self.source)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PositionTracker {
    #[must_use]
    pub fn new(source: Arc<dyn LocationSource>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            source,
            latest: Arc::new(RwLock::new(None)),
            event_tx,
            cancel_token: None,
        }
    }

    /// Start watching. Restarts the subscription if already running.
    pub fn start(&mut self, options: WatchOptions) {
        self.stop();

        let cancel_token = CancellationToken::new();
        let mut rx = self.source.watch(options, cancel_token.clone());
        let latest = Arc::clone(&self.latest);
        let event_tx = self.event_tx.clone();
        let task_cancel = cancel_token.clone();

        info!(
            "Position tracking started ({} accuracy, timeout {:?})",
            if options.high_accuracy { "high" } else { "standard" },
            options.timeout
        );

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                    () = task_cancel.cancelled() => break,
                };

                let event = match item {
                    Ok(fix) => {
                        let mut guard = latest.write().unwrap_or_else(PoisonError::into_inner);
                        let record = PositionRecord::from_fix(fix, guard.as_ref());
                        if record.accuracy.is_some_and(|a| a > POOR_ACCURACY_METERS) {
                            debug!("Poor position accuracy: {:.0} m", record.accuracy.unwrap_or_default());
                        }
                        *guard = Some(record.clone());
                        Ok(record)
                    }
                    Err(e) => {
                        warn!("Location error: {}", e);
                        Err(e)
                    }
                };
                let _ = event_tx.send(event);
            }
            debug!("Position tracking task finished");
        });

        self.cancel_token = Some(cancel_token);
    }

    /// Stop watching. Safe to call when not started.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
            info!("Position tracking stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.cancel_token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Most recent position, if any.
    #[must_use]
    pub fn latest(&self) -> Option<PositionRecord> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to position updates and errors.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for PositionTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::meters_to_lat_degrees;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_speed_synthesized_from_previous() {
        let first = PositionRecord::from_fix(Fix::at(25.0, 121.0, t(0)), None);
        assert_eq!(first.speed, None);

        let north = 25.0 + meters_to_lat_degrees(100.0);
        let second = PositionRecord::from_fix(Fix::at(north, 121.0, t(10)), Some(&first));
        assert!((second.speed.unwrap() - 10.0).abs() < 0.01);
        assert!((second.speed_kmh().unwrap() - 36.0).abs() < 0.1);
    }

    #[test]
    fn test_speed_none_when_elapsed_not_positive() {
        let first = PositionRecord::from_fix(Fix::at(25.0, 121.0, t(10)), None);
        let same_time = PositionRecord::from_fix(Fix::at(25.001, 121.0, t(10)), Some(&first));
        assert_eq!(same_time.speed, None);
        let earlier = PositionRecord::from_fix(Fix::at(25.001, 121.0, t(5)), Some(&first));
        assert_eq!(earlier.speed, None);
    }

    #[test]
    fn test_reported_speed_wins() {
        let first = PositionRecord::from_fix(Fix::at(25.0, 121.0, t(0)), None);
        let mut fix = Fix::at(25.01, 121.0, t(1));
        fix.speed = Some(2.5);
        assert_eq!(PositionRecord::from_fix(fix, Some(&first)).speed, Some(2.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_publishes_in_order_and_survives_errors() {
        let source = ScriptedSource::new(vec![
            (Duration::from_secs(1), Ok(Fix::at(25.0, 121.0, t(0)))),
            (Duration::from_secs(1), Err(LocationError::Timeout(Duration::from_secs(20)))),
            (Duration::from_secs(1), Ok(Fix::at(25.001, 121.0, t(2)))),
        ]);
        let mut tracker = PositionTracker::new(Arc::new(source));
        let mut rx = tracker.subscribe();
        tracker.start(WatchOptions::default());

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.lat, 25.0);
        assert!(matches!(rx.recv().await.unwrap(), Err(LocationError::Timeout(_))));
        let third = rx.recv().await.unwrap().unwrap();
        assert_eq!(third.lat, 25.001);
        assert!(third.speed.is_some());
        assert_eq!(tracker.latest(), Some(third));

        tracker.stop();
        assert!(!tracker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start_is_noop() {
        let mut tracker = PositionTracker::new(Arc::new(ScriptedSource::default()));
        tracker.stop();
        tracker.stop();
        assert!(!tracker.is_running());
        assert!(tracker.latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_delivery() {
        let source = ScriptedSource::every(
            Duration::from_secs(5),
            vec![Fix::at(1.0, 1.0, t(0)), Fix::at(2.0, 2.0, t(5))],
        );
        let mut tracker = PositionTracker::new(Arc::new(source));
        let mut rx = tracker.subscribe();
        tracker.start(WatchOptions::default());

        assert!(rx.recv().await.unwrap().is_ok());
        tracker.stop();
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.latest().map(|p| p.lat), Some(1.0));
    }
}
