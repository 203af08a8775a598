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

//! Proximity monitoring for the tracked marker.
//!
//! Each marker is either out of range or in range of the current position.
//! Entering the alert radius fires one alert immediately and starts a repeat
//! timer that re-measures the distance on every tick: it alerts again while
//! the position is still inside the radius and cancels itself otherwise.
//!
//! All state lives behind one lock. Every check, whether triggered by a
//! position update or by a timer tick, reads the current position and target
//! under that lock, so a tick can never act on a target that has since been
//! replaced. Stopping tracking cancels every timer and clears the state in a
//! single critical section.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::alert::AlertDispatcher;
use crate::model::Marker;
use crate::position::{PositionEvent, PositionRecord};
use crate::settings::Settings;

/// Range state of a single marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    OutOfRange,
    InRange,
}

/// Events published by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProximityEvent {
    /// Entered the alert radius; an alert was fired.
    Entered { marker_id: String, distance_m: f64 },
    /// Repeat timer fired another alert.
    Repeated { marker_id: String, distance_m: f64 },
    /// Left the alert radius; the repeat timer was cancelled.
    Exited { marker_id: String, distance_m: f64 },
    TargetChanged { marker_id: Option<String> },
    Stopped,
}

#[derive(Debug, Default)]
struct MonitorState {
    settings: Settings,
    position: Option<PositionRecord>,
    target: Option<Marker>,
    in_range: HashSet<String>,
    alert_timers: HashMap<String, CancellationToken>,
    check_timer: Option<CancellationToken>,
    feed: Option<CancellationToken>,
    is_tracking: bool,
}

impl MonitorState {
    fn active(&self) -> bool {
        self.is_tracking && self.settings.enable_notifications && self.target.is_some()
    }

    fn cancel_alert_timer(&mut self, marker_id: &str) {
        if let Some(token) = self.alert_timers.remove(marker_id) {
            token.cancel();
            debug!("Cancelled alert timer for marker {}", marker_id);
        }
    }

    /// Drop all per-marker range state and timers.
    fn reset_ranges(&mut self) {
        for (marker_id, token) in self.alert_timers.drain() {
            token.cancel();
            debug!("Cancelled alert timer for marker {}", marker_id);
        }
        self.in_range.clear();
    }
}

struct Inner {
    state: Mutex<MonitorState>,
    dispatcher: AlertDispatcher,
    event_tx: broadcast::Sender<ProximityEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ProximityEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Evaluate the range transition for the current target.
    fn check_locked(self: &Arc<Self>, state: &mut MonitorState) -> Option<RangeState> {
        if !state.active() {
            return None;
        }
        let (Some(target), Some(position)) = (state.target.as_ref(), state.position.as_ref()) else {
            return None;
        };

        let distance = target.distance_from(position.lat, position.lng);
        let within = distance <= state.settings.alert_distance_m();
        let was_in_range = state.in_range.contains(&target.id);

        match (within, was_in_range) {
            (true, false) => {
                let target = target.clone();
                info!(
                    "Entered range of marker '{}' ({}) at {:.0} m",
                    target.name, target.id, distance
                );
                state.in_range.insert(target.id.clone());
                self.dispatcher.fire_alert(&target, distance);
                self.spawn_alert_timer(state, &target.id);
                self.emit(ProximityEvent::Entered {
                    marker_id: target.id,
                    distance_m: distance,
                });
                Some(RangeState::InRange)
            }
            (false, true) => {
                let marker_id = target.id.clone();
                info!("Left range of marker {} at {:.0} m", marker_id, distance);
                state.in_range.remove(&marker_id);
                state.cancel_alert_timer(&marker_id);
                self.emit(ProximityEvent::Exited {
                    marker_id,
                    distance_m: distance,
                });
                Some(RangeState::OutOfRange)
            }
            (true, true) => Some(RangeState::InRange),
            (false, false) => Some(RangeState::OutOfRange),
        }
    }

    /// Start the repeat timer for `marker_id`, replacing any existing one.
    fn spawn_alert_timer(self: &Arc<Self>, state: &mut MonitorState, marker_id: &str) {
        state.cancel_alert_timer(marker_id);

        let token = CancellationToken::new();
        state.alert_timers.insert(marker_id.to_string(), token.clone());
        let period = state.settings.alert_period();
        let weak = Arc::downgrade(self);
        let marker_id = marker_id.to_string();
        debug!("Alert timer for marker {} every {:?}", marker_id, period);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = token.cancelled() => return,
                }
                let Some(inner) = weak.upgrade() else { return };
                if !inner.repeat_tick(&marker_id, &token) {
                    return;
                }
            }
        });
    }

    /// One repeat-timer tick. Returns false once the timer is finished.
    fn repeat_tick(self: &Arc<Self>, marker_id: &str, token: &CancellationToken) -> bool {
        let mut state = self.lock();
        if token.is_cancelled() {
            return false;
        }

        let measured = match (state.active(), state.target.as_ref(), state.position.as_ref()) {
            (true, Some(target), Some(position)) if target.id == marker_id => {
                Some((target.clone(), target.distance_from(position.lat, position.lng)))
            }
            _ => None,
        };

        match measured {
            Some((target, distance)) if distance <= state.settings.alert_distance_m() => {
                info!(
                    "Still within range of marker '{}' ({}) at {:.0} m",
                    target.name, target.id, distance
                );
                self.dispatcher.fire_alert(&target, distance);
                self.emit(ProximityEvent::Repeated {
                    marker_id: target.id,
                    distance_m: distance,
                });
                true
            }
            Some((target, distance)) => {
                info!("Left range of marker {} at {:.0} m", target.id, distance);
                state.in_range.remove(&target.id);
                state.cancel_alert_timer(&target.id);
                self.emit(ProximityEvent::Exited {
                    marker_id: target.id,
                    distance_m: distance,
                });
                false
            }
            None => {
                state.in_range.remove(marker_id);
                state.cancel_alert_timer(marker_id);
                false
            }
        }
    }

    /// Periodic check while tracking, in addition to position-driven checks.
    fn spawn_check_timer(self: &Arc<Self>, state: &mut MonitorState) {
        if let Some(old) = state.check_timer.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        state.check_timer = Some(token.clone());
        let period = state.settings.alert_period();
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = token.cancelled() => return,
                }
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.lock();
                if token.is_cancelled() {
                    return;
                }
                inner.check_locked(&mut state);
            }
        });
    }
}

/// Proximity state machine and repeat-alert scheduler.
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct ProximityMonitor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProximityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ProximityMonitor")
            .field("is_tracking", &state.is_tracking)
            .field("target", &state.target.as_ref().map(|t| &t.id))
            .field("in_range", &state.in_range)
            .finish_non_exhaustive()
    }
}

impl ProximityMonitor {
    #[must_use]
    pub fn new(settings: Settings, dispatcher: AlertDispatcher) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MonitorState {
                    settings,
                    ..MonitorState::default()
                }),
                dispatcher,
                event_tx,
            }),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProximityEvent> {
        self.inner.event_tx.subscribe()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.inner.dispatcher
    }

    /// Begin monitoring and run an immediate check.
    pub fn start_tracking(&self) {
        let mut state = self.inner.lock();
        if state.is_tracking {
            return;
        }
        state.is_tracking = true;
        info!("Proximity tracking started");
        self.inner.spawn_check_timer(&mut state);
        self.inner.check_locked(&mut state);
    }

    /// Stop monitoring: cancel the position feed and every timer, clear the
    /// range state and the target.
    pub fn stop_tracking(&self) {
        let mut state = self.inner.lock();
        if let Some(feed) = state.feed.take() {
            feed.cancel();
        }
        if let Some(check) = state.check_timer.take() {
            check.cancel();
        }
        state.reset_ranges();
        state.target = None;
        let was_tracking = std::mem::replace(&mut state.is_tracking, false);
        drop(state);

        if was_tracking {
            info!("Proximity tracking stopped");
            self.inner.emit(ProximityEvent::Stopped);
        }
    }

    /// Feed position updates from a tracker subscription until tracking stops.
    pub fn follow(&self, mut rx: broadcast::Receiver<PositionEvent>) {
        let token = CancellationToken::new();
        {
            let mut state = self.inner.lock();
            if let Some(old) = state.feed.replace(token.clone()) {
                old.cancel();
            }
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    () = token.cancelled() => return,
                };
                match event {
                    Ok(Ok(record)) => monitor.update_position(record),
                    Ok(Err(e)) => debug!("Ignoring location error in monitor: {}", e),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Monitor lagged {} position updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Record a new position and re-evaluate the target.
    pub fn update_position(&self, position: PositionRecord) {
        let mut state = self.inner.lock();
        state.position = Some(position);
        self.inner.check_locked(&mut state);
    }

    /// Re-evaluate the target against the current position.
    pub fn check(&self) -> Option<RangeState> {
        let mut state = self.inner.lock();
        self.inner.check_locked(&mut state)
    }

    /// Track `marker`, discarding all state of the previous target.
    pub fn set_tracking_target(&self, marker: Marker) {
        let mut state = self.inner.lock();
        state.reset_ranges();
        info!("Tracking marker '{}' ({})", marker.name, marker.id);
        let marker_id = marker.id.clone();
        state.target = Some(marker);
        self.inner.emit(ProximityEvent::TargetChanged {
            marker_id: Some(marker_id),
        });
        self.inner.check_locked(&mut state);
    }

    pub fn clear_tracking_target(&self) {
        let mut state = self.inner.lock();
        state.reset_ranges();
        if state.target.take().is_some() {
            self.inner.emit(ProximityEvent::TargetChanged { marker_id: None });
        }
    }

    /// Replace the stored copy of the target after an edit, keeping range state.
    pub fn refresh_target(&self, marker: &Marker) {
        let mut state = self.inner.lock();
        if state.target.as_ref().is_some_and(|t| t.id == marker.id) {
            state.target = Some(marker.clone());
        }
    }

    /// Purge every trace of a deleted marker.
    pub fn forget_marker(&self, marker_id: &str) {
        let mut state = self.inner.lock();
        state.in_range.remove(marker_id);
        state.cancel_alert_timer(marker_id);
        if state.target.as_ref().is_some_and(|t| t.id == marker_id) {
            state.target = None;
            self.inner.emit(ProximityEvent::TargetChanged { marker_id: None });
        }
    }

    /// Change the repeat period; running timers restart with the new period.
    pub fn set_alert_interval(&self, seconds: u32) {
        let mut state = self.inner.lock();
        state.settings.alert_interval = seconds.max(1);
        info!("Alert interval set to {} s", state.settings.alert_interval);

        let running: Vec<String> = state.alert_timers.keys().cloned().collect();
        for marker_id in running {
            self.inner.spawn_alert_timer(&mut state, &marker_id);
        }
        if state.is_tracking {
            self.inner.spawn_check_timer(&mut state);
        }
    }

    pub fn set_alert_distance(&self, meters: u32) {
        let mut state = self.inner.lock();
        state.settings.alert_distance = meters.max(1);
        info!("Alert distance set to {} m", state.settings.alert_distance);
        self.inner.check_locked(&mut state);
    }

    /// Disabling notifications suspends monitoring and cancels all timers.
    pub fn set_notifications_enabled(&self, enabled: bool) {
        let mut state = self.inner.lock();
        state.settings.enable_notifications = enabled;
        if enabled {
            self.inner.check_locked(&mut state);
        } else {
            state.reset_ranges();
        }
    }

    /// Replace all settings, applying interval changes to running timers.
    pub fn apply_settings(&self, settings: &Settings) {
        self.set_alert_distance(settings.alert_distance);
        self.set_notifications_enabled(settings.enable_notifications);
        let interval_changed = self.inner.lock().settings.alert_interval != settings.alert_interval;
        if interval_changed {
            self.set_alert_interval(settings.alert_interval);
        }
        self.inner.lock().settings = settings.clone();
    }

    #[must_use]
    pub fn settings(&self) -> Settings {
        self.inner.lock().settings.clone()
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.inner.lock().is_tracking
    }

    #[must_use]
    pub fn tracking_target(&self) -> Option<Marker> {
        self.inner.lock().target.clone()
    }

    #[must_use]
    pub fn current_position(&self) -> Option<PositionRecord> {
        self.inner.lock().position.clone()
    }

    #[must_use]
    pub fn in_range(&self) -> HashSet<String> {
        self.inner.lock().in_range.clone()
    }

    #[must_use]
    pub fn state_of(&self, marker_id: &str) -> RangeState {
        if self.inner.lock().in_range.contains(marker_id) {
            RangeState::InRange
        } else {
            RangeState::OutOfRange
        }
    }

    /// Whether a repeat timer is scheduled for `marker_id`.
    #[must_use]
    pub fn has_alert_timer(&self, marker_id: &str) -> bool {
        self.inner.lock().alert_timers.contains_key(marker_id)
    }

    /// Distance to the target from the current position.
    #[must_use]
    pub fn target_distance(&self) -> Option<f64> {
        let state = self.inner.lock();
        let target = state.target.as_ref()?;
        let position = state.position.as_ref()?;
        Some(target.distance_from(position.lat, position.lng))
    }

    /// Current repeat period.
    #[must_use]
    pub fn alert_period(&self) -> Duration {
        self.inner.lock().settings.alert_period()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.reset_ranges();
        for token in [state.check_timer.take(), state.feed.take()].into_iter().flatten() {
            token.cancel();
        }
    }
}
