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

//! Application state tying the data model, filter and proximity monitor
//! together.
//!
//! Deleting an entity through the [`Session`] removes it from every place
//! that can refer to it: container back-references, the monitor's target,
//! range set and timers, the active filter and the current selection.

use std::sync::Arc;

use log::info;

use crate::alert::AlertDispatcher;
use crate::filter::{resolve_visible_markers, Filter};
use crate::model::{EntityKind, MapData, Marker, ModelError};
use crate::persistence::{ExportDocument, PersistError, SavedState};
use crate::position::{LocationSource, PositionRecord, PositionTracker};
use crate::proximity::ProximityMonitor;
use crate::settings::{Settings, SettingsError};

#[derive(Debug)]
pub struct Session {
    data: MapData,
    settings: Settings,
    filter: Filter,
    current_group: Option<String>,
    current_subgroup: Option<String>,
    monitor: ProximityMonitor,
    tracker: Option<PositionTracker>,
}

impl Session {
    #[must_use]
    pub fn new(settings: Settings, dispatcher: AlertDispatcher) -> Self {
        Self {
            data: MapData::new(),
            monitor: ProximityMonitor::new(settings.clone(), dispatcher),
            settings,
            filter: Filter::None,
            current_group: None,
            current_subgroup: None,
            tracker: None,
        }
    }

    /// Restore a session from a saved snapshot.
    #[must_use]
    pub fn restore(saved: SavedState, dispatcher: AlertDispatcher) -> Self {
        let mut session = Self::new(saved.settings, dispatcher);
        session.data = saved.data;
        session.current_group = saved.current_group;
        session.current_subgroup = saved.current_subgroup;
        session
    }

    /// Snapshot of the persistent part of the session.
    #[must_use]
    pub fn to_saved(&self) -> SavedState {
        SavedState {
            data: self.data.clone(),
            settings: self.settings.clone(),
            current_group: self.current_group.clone(),
            current_subgroup: self.current_subgroup.clone(),
        }
    }

    #[must_use]
    pub fn data(&self) -> &MapData {
        &self.data
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    #[must_use]
    pub fn monitor(&self) -> &ProximityMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn selection(&self) -> (Option<&str>, Option<&str>) {
        (self.current_group.as_deref(), self.current_subgroup.as_deref())
    }

    pub fn create_group(&mut self, name: &str) -> String {
        self.data.create_group(name).id.clone()
    }

    pub fn add_subgroup(&mut self, group_id: &str, name: &str) -> Result<String, ModelError> {
        Ok(self.data.add_subgroup(group_id, name)?.id.clone())
    }

    pub fn add_marker(&mut self, marker: Marker) -> Result<(), ModelError> {
        self.data.add_marker(marker)
    }

    /// Replace a marker's attributes. A tracked marker's new position is
    /// used from the next check on.
    pub fn update_marker(&mut self, marker: Marker) -> Result<Marker, ModelError> {
        let previous = self.data.update_marker(marker)?;
        if let Some(updated) = self.data.marker(&previous.id) {
            self.monitor.refresh_target(updated);
        }
        Ok(previous)
    }

    pub fn reparent_marker(
        &mut self,
        marker_id: &str,
        group_id: &str,
        subgroup_id: Option<&str>,
    ) -> Result<(), ModelError> {
        self.data.reparent_marker(marker_id, group_id, subgroup_id)?;
        if let Some(updated) = self.data.marker(marker_id) {
            self.monitor.refresh_target(updated);
        }
        Ok(())
    }

    pub fn remove_marker(&mut self, marker_id: &str) -> Result<Marker, ModelError> {
        let marker = self.data.remove_marker(marker_id)?;
        self.forget_marker(marker_id);
        Ok(marker)
    }

    /// Remove a subgroup; its markers stay in the group with no subgroup.
    pub fn remove_subgroup(&mut self, group_id: &str, subgroup_id: &str) -> Result<Vec<String>, ModelError> {
        let detached = self.data.remove_subgroup(group_id, subgroup_id)?;
        for marker_id in &detached {
            if let Some(marker) = self.data.marker(marker_id) {
                self.monitor.refresh_target(marker);
            }
        }
        if self.filter.references(subgroup_id) {
            self.filter = Filter::None;
        }
        if self.current_subgroup.as_deref() == Some(subgroup_id) {
            self.current_subgroup = None;
        }
        Ok(detached)
    }

    /// Remove a group together with its subgroups and markers.
    pub fn remove_group(&mut self, group_id: &str) -> Result<Vec<Marker>, ModelError> {
        let subgroup_ids: Vec<String> = self
            .data
            .group(group_id)
            .map(|g| g.subgroups.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default();

        let removed = self.data.remove_group(group_id)?;
        for marker in &removed {
            self.forget_marker(&marker.id);
        }
        if self.filter.references(group_id) || subgroup_ids.iter().any(|s| self.filter.references(s)) {
            self.filter = Filter::None;
        }
        if self.current_group.as_deref() == Some(group_id) {
            self.current_group = None;
            self.current_subgroup = None;
        }
        Ok(removed)
    }

    fn forget_marker(&mut self, marker_id: &str) {
        self.monitor.forget_marker(marker_id);
        if self.filter.references(marker_id) {
            self.filter = Filter::None;
        }
    }

    /// Select a group (and optionally one of its subgroups), or clear the
    /// selection with `None`. The filter follows the selection.
    pub fn select_group(&mut self, group_id: Option<&str>, subgroup_id: Option<&str>) -> Result<(), ModelError> {
        let Some(group_id) = group_id else {
            self.current_group = None;
            self.current_subgroup = None;
            self.filter = Filter::None;
            return Ok(());
        };

        let group = self.data.group(group_id).ok_or_else(|| ModelError::NotFound {
            kind: EntityKind::Group,
            id: group_id.to_string(),
        })?;
        if let Some(subgroup_id) = subgroup_id {
            if group.subgroup(subgroup_id).is_none() {
                return Err(ModelError::NotFound {
                    kind: EntityKind::Subgroup,
                    id: subgroup_id.to_string(),
                });
            }
        }

        self.current_group = Some(group_id.to_string());
        self.current_subgroup = subgroup_id.map(str::to_string);
        self.filter = match subgroup_id {
            Some(s) => Filter::Subgroup(s.to_string()),
            None => Filter::Group(group_id.to_string()),
        };
        Ok(())
    }

    pub fn show_only_marker(&mut self, marker_id: &str) -> Result<(), ModelError> {
        if self.data.marker(marker_id).is_none() {
            return Err(ModelError::NotFound {
                kind: EntityKind::Marker,
                id: marker_id.to_string(),
            });
        }
        self.filter = Filter::Marker(marker_id.to_string());
        Ok(())
    }

    pub fn clear_filter(&mut self) {
        self.filter = Filter::None;
    }

    #[must_use]
    pub fn visible_markers(&self) -> Vec<&Marker> {
        resolve_visible_markers(
            self.data.markers(),
            &self.filter,
            self.current_group.as_deref(),
            self.current_subgroup.as_deref(),
        )
    }

    /// Make `marker_id` the single tracked marker.
    pub fn track_marker(&mut self, marker_id: &str) -> Result<(), ModelError> {
        let marker = self.data.marker(marker_id).cloned().ok_or_else(|| ModelError::NotFound {
            kind: EntityKind::Marker,
            id: marker_id.to_string(),
        })?;
        self.monitor.set_tracking_target(marker);
        Ok(())
    }

    /// Start position tracking from `source` and feed it into the monitor.
    /// The tracked marker, if any, is kept.
    pub fn start_tracking(&mut self, source: Arc<dyn LocationSource>) {
        if let Some(mut previous) = self.tracker.take() {
            previous.stop();
        }

        let mut tracker = PositionTracker::new(source);
        self.monitor.follow(tracker.subscribe());
        tracker.start(self.settings.watch_options());
        self.monitor.start_tracking();
        self.tracker = Some(tracker);
    }

    /// Stop tracking: monitor state is cleared first so no timer can fire
    /// once this returns, then the position subscription is cancelled.
    pub fn stop_tracking(&mut self) {
        self.monitor.stop_tracking();
        if let Some(mut tracker) = self.tracker.take() {
            tracker.stop();
        }
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.monitor.is_tracking()
    }

    #[must_use]
    pub fn latest_position(&self) -> Option<PositionRecord> {
        self.tracker
            .as_ref()
            .and_then(PositionTracker::latest)
            .or_else(|| self.monitor.current_position())
    }

    /// Apply new settings. A running tracker is restarted when its watch
    /// options change.
    pub fn update_settings(&mut self, settings: Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        self.monitor.apply_settings(&settings);
        let options = settings.watch_options();
        let restart = options != self.settings.watch_options();
        self.settings = settings;

        if let Some(tracker) = self.tracker.as_mut().filter(|t| restart && t.is_running()) {
            info!("Location options changed, restarting position tracking");
            tracker.start(options);
        }
        Ok(())
    }

    #[must_use]
    pub fn export(&self) -> ExportDocument {
        ExportDocument::new(&self.data, &self.settings)
    }

    /// Replace all data with an export document. On error nothing changes.
    pub fn import(&mut self, json: &str) -> Result<(), PersistError> {
        let document = ExportDocument::parse(json)?;
        let (data, settings) = document.into_data();

        self.monitor.clear_tracking_target();
        self.data = data;
        self.filter = Filter::None;
        self.current_group = None;
        self.current_subgroup = None;
        if let Some(imported) = settings {
            let mut merged = self.settings.clone();
            imported.apply_to(&mut merged);
            self.monitor.apply_settings(&merged);
            self.settings = merged;
        }
        info!(
            "Imported {} groups and {} markers",
            self.data.groups().len(),
            self.data.markers().len()
        );
        Ok(())
    }

    /// Wipe all data, stop tracking and restore default settings.
    pub fn reset(&mut self) {
        self.stop_tracking();
        self.data.clear();
        self.filter = Filter::None;
        self.current_group = None;
        self.current_subgroup = None;
        self.settings = Settings::default();
        self.monitor.apply_settings(&self.settings);
        info!("Session reset");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_tracking();
    }
}
