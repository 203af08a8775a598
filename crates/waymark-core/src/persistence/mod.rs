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

//! Local snapshot persistence and JSON export/import.
//!
//! The snapshot holds groups, markers, settings and the current selection.
//! Positions and tracking state are never written. Loading rebuilds the
//! ownership links from ids and keeps markers with dangling references in
//! the flat list.
//!
//! Older snapshots stored `imageData` as a single string; it is read as a
//! one-element list and always written back as a list.

mod store;

use std::collections::HashSet;

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Group, ImageRef, MapData, Marker, MarkerColor, Subgroup, DEFAULT_MARKER_ICON};
use crate::settings::Settings;

pub use store::{FileStore, LocalStore, MemoryStore};

/// Key of the local snapshot.
pub const SNAPSHOT_KEY: &str = "mapAnnotationData";
pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// `imageData` as found in stored records.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StoredImages {
    Many(Vec<String>),
    One(String),
}

pub(crate) fn deserialize_images<'de, D>(d: D) -> Result<Vec<ImageRef>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<StoredImages>::deserialize(d)? {
        None => Vec::new(),
        Some(StoredImages::One(s)) if s.is_empty() => Vec::new(),
        Some(StoredImages::One(s)) => vec![ImageRef::from(s)],
        Some(StoredImages::Many(v)) => v.into_iter().map(ImageRef::from).collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub lat: f64,
    pub lng: f64,
    pub group_id: String,
    #[serde(default)]
    pub subgroup_id: Option<String>,
    #[serde(default)]
    pub color: MarkerColor,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default, rename = "imageData", deserialize_with = "deserialize_images")]
    pub images: Vec<ImageRef>,
}

fn default_icon() -> String {
    DEFAULT_MARKER_ICON.to_string()
}

impl From<&Marker> for MarkerRecord {
    fn from(m: &Marker) -> Self {
        Self {
            id: m.id.clone(),
            name: m.name.clone(),
            description: m.description.clone(),
            lat: m.lat,
            lng: m.lng,
            group_id: m.group_id.clone(),
            subgroup_id: m.subgroup_id.clone(),
            color: m.color,
            icon: m.icon.clone(),
            images: m.images.clone(),
        }
    }
}

impl From<MarkerRecord> for Marker {
    fn from(r: MarkerRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            description: r.description,
            lat: r.lat,
            lng: r.lng,
            group_id: r.group_id,
            subgroup_id: r.subgroup_id,
            color: r.color,
            icon: r.icon,
            images: r.images,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgroupRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subgroups: Vec<SubgroupRecord>,
}

impl From<&Group> for GroupRecord {
    fn from(g: &Group) -> Self {
        Self {
            id: g.id.clone(),
            name: g.name.clone(),
            subgroups: g
                .subgroups
                .iter()
                .map(|s| SubgroupRecord {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    group_id: s.group_id.clone(),
                })
                .collect(),
        }
    }
}

impl From<GroupRecord> for Group {
    fn from(r: GroupRecord) -> Self {
        let mut group = Group::new(r.id, r.name);
        for s in r.subgroups {
            // The owning group is authoritative for the back-reference.
            if !s.group_id.is_empty() && s.group_id != group.id {
                warn!(
                    "Subgroup {} claims group {} but is stored under {}",
                    s.id, s.group_id, group.id
                );
            }
            group.subgroups.push(Subgroup::new(s.id, s.name, group.id.clone()));
        }
        group
    }
}

/// Split a model into its record form.
#[must_use]
pub fn to_records(data: &MapData) -> (Vec<GroupRecord>, Vec<MarkerRecord>) {
    (
        data.groups().iter().map(GroupRecord::from).collect(),
        data.markers().iter().map(MarkerRecord::from).collect(),
    )
}

/// Rebuild a model from records. Returns the ids of unattached markers.
#[must_use]
pub fn from_records(groups: Vec<GroupRecord>, markers: Vec<MarkerRecord>) -> (MapData, Vec<String>) {
    MapData::from_parts(
        groups.into_iter().map(Group::from).collect(),
        markers.into_iter().map(Marker::from).collect(),
    )
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    groups: Vec<GroupRecord>,
    #[serde(default)]
    markers: Vec<MarkerRecord>,
    #[serde(flatten)]
    settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_subgroup: Option<String>,
}

/// Everything restored from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedState {
    pub data: MapData,
    pub settings: Settings,
    pub current_group: Option<String>,
    pub current_subgroup: Option<String>,
}

/// Reads and writes the local snapshot.
#[derive(Debug)]
pub struct LocalPersistence<S> {
    store: S,
}

impl<S: LocalStore> LocalPersistence<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn save(&self, state: &SavedState) -> Result<(), PersistError> {
        let (groups, markers) = to_records(&state.data);
        let snapshot = Snapshot {
            groups,
            markers,
            settings: state.settings.clone(),
            current_group: state.current_group.clone(),
            current_subgroup: state.current_subgroup.clone(),
        };
        self.store.set(SNAPSHOT_KEY, &serde_json::to_string(&snapshot)?)
    }

    /// Load the snapshot, or `None` if nothing has been saved yet.
    pub fn load(&self) -> Result<Option<SavedState>, PersistError> {
        let Some(raw) = self.store.get(SNAPSHOT_KEY)? else {
            return Ok(None);
        };
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        let (data, dangling) = from_records(snapshot.groups, snapshot.markers);
        if !dangling.is_empty() {
            warn!("{} markers have dangling group/subgroup references", dangling.len());
        }

        // Drop a selection that no longer resolves.
        let current_group = snapshot.current_group.filter(|g| data.group(g).is_some());
        let current_subgroup = match current_group.as_deref() {
            Some(group_id) => snapshot
                .current_subgroup
                .filter(|s| data.group(group_id).is_some_and(|g| g.subgroup(s).is_some())),
            None => None,
        };

        info!(
            "Loaded {} groups and {} markers",
            data.groups().len(),
            data.markers().len()
        );
        Ok(Some(SavedState {
            data,
            settings: snapshot.settings,
            current_group,
            current_subgroup,
        }))
    }

    pub fn clear(&self) -> Result<(), PersistError> {
        self.store.remove(SNAPSHOT_KEY)
    }
}

/// Settings carried in an export document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSettings {
    #[serde(default)]
    pub alert_distance: Option<u32>,
    #[serde(default)]
    pub alert_interval: Option<u32>,
    #[serde(default)]
    pub enable_notifications: Option<bool>,
}

impl ExportSettings {
    /// Overlay the values present in the document onto `settings`.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(d) = self.alert_distance.filter(|d| *d > 0) {
            settings.alert_distance = d;
        }
        if let Some(i) = self.alert_interval.filter(|i| *i > 0) {
            settings.alert_interval = i;
        }
        if let Some(n) = self.enable_notifications {
            settings.enable_notifications = n;
        }
    }
}

/// Portable JSON export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub export_date: String,
    pub markers: Vec<MarkerRecord>,
    pub groups: Vec<GroupRecord>,
    #[serde(default)]
    pub settings: Option<ExportSettings>,
}

impl ExportDocument {
    #[must_use]
    pub fn new(data: &MapData, settings: &Settings) -> Self {
        let (groups, markers) = to_records(data);
        Self {
            version: EXPORT_VERSION.to_string(),
            export_date: Utc::now().to_rfc3339(),
            markers,
            groups,
            settings: Some(ExportSettings {
                alert_distance: Some(settings.alert_distance),
                alert_interval: Some(settings.alert_interval),
                enable_notifications: Some(settings.enable_notifications),
            }),
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse an export document, rejecting any without `markers` or `groups`.
    pub fn parse(json: &str) -> Result<Self, PersistError> {
        let value: Value = serde_json::from_str(json)?;
        let Some(object) = value.as_object() else {
            return Err(PersistError::Parse("import document is not an object".to_string()));
        };
        for key in ["markers", "groups"] {
            if !object.get(key).is_some_and(Value::is_array) {
                return Err(PersistError::Parse(format!(
                    "import document is missing '{key}'"
                )));
            }
        }
        let document: Self = serde_json::from_value(value)?;
        document.check_unique_ids()?;
        Ok(document)
    }

    fn check_unique_ids(&self) -> Result<(), PersistError> {
        let mut seen = HashSet::new();
        let group_ids = self.groups.iter().map(|g| ("group", g.id.as_str()));
        let subgroup_ids = self
            .groups
            .iter()
            .flat_map(|g| g.subgroups.iter().map(|s| ("subgroup", s.id.as_str())));
        let marker_ids = self.markers.iter().map(|m| ("marker", m.id.as_str()));
        for (kind, id) in group_ids.chain(subgroup_ids).chain(marker_ids) {
            if !seen.insert((kind, id)) {
                return Err(PersistError::Parse(format!("duplicate {kind} id '{id}'")));
            }
        }
        Ok(())
    }

    /// Build the model from this document.
    #[must_use]
    pub fn into_data(self) -> (MapData, Option<ExportSettings>) {
        let (data, dangling) = from_records(self.groups, self.markers);
        if !dangling.is_empty() {
            warn!("Imported {} markers with dangling references", dangling.len());
        }
        (data, self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MapData {
        let mut data = MapData::new();
        let g = data.create_group("Hiking").id.clone();
        let s = data.add_subgroup(&g, "Trail").unwrap().id.clone();
        let mut m = Marker::new("Summit", 25.1, 121.5, &g)
            .in_subgroup(&s)
            .described("top")
            .colored(MarkerColor::Green);
        m.images = vec![
            ImageRef::Url("https://cdn/x.jpg".to_string()),
            ImageRef::Inline("data:image/jpeg;base64,AAAA".to_string()),
        ];
        data.add_marker(m).unwrap();
        data.add_marker(Marker::new("Parking", 25.0, 121.4, &g)).unwrap();
        data
    }

    #[test]
    fn test_snapshot_round_trip() {
        let persistence = LocalPersistence::new(MemoryStore::new());
        assert!(persistence.load().unwrap().is_none());

        let data = sample();
        let group_id = data.groups()[0].id.clone();
        let state = SavedState {
            data,
            settings: Settings {
                alert_distance: 250,
                ..Settings::default()
            },
            current_group: Some(group_id),
            current_subgroup: None,
        };
        persistence.save(&state).unwrap();

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_snapshot_excludes_selection_that_no_longer_resolves() {
        let persistence = LocalPersistence::new(MemoryStore::new());
        let state = SavedState {
            data: sample(),
            settings: Settings::default(),
            current_group: Some("gone".to_string()),
            current_subgroup: Some("gone-too".to_string()),
        };
        persistence.save(&state).unwrap();
        let loaded = persistence.load().unwrap().unwrap();
        assert!(loaded.current_group.is_none());
        assert!(loaded.current_subgroup.is_none());
    }

    #[test]
    fn test_legacy_snapshot_migrates() {
        let store = MemoryStore::new();
        store
            .set(
                SNAPSHOT_KEY,
                r#"{
                    "groups": [{"id": "g1", "name": "Food", "subgroups": [{"id": "s1", "name": "Cafes", "groupId": "g1"}]}],
                    "markers": [
                        {"id": "m1", "name": "A", "lat": 1.0, "lng": 2.0, "groupId": "g1", "subgroupId": "s1",
                         "color": "blue", "icon": "☕", "imageData": "data:image/png;base64,AAAA"},
                        {"id": "m2", "name": "B", "lat": 1.0, "lng": 2.0, "groupId": "g1", "imageData": null},
                        {"id": "m3", "name": "C", "lat": 1.0, "lng": 2.0, "groupId": "missing"}
                    ],
                    "alertDistance": 150,
                    "alertInterval": 0
                }"#,
            )
            .unwrap();

        let loaded = LocalPersistence::new(store).load().unwrap().unwrap();
        assert_eq!(loaded.settings.alert_distance, 150);
        assert_eq!(loaded.settings.alert_interval, 30);

        let m1 = loaded.data.marker("m1").unwrap();
        assert_eq!(m1.images.len(), 1);
        assert!(m1.images[0].is_inline());
        assert!(loaded.data.marker("m2").unwrap().images.is_empty());
        assert!(loaded.data.marker("m3").is_some());
        assert!(loaded.data.find_subgroup("s1").unwrap().marker_refs.contains("m1"));
    }

    #[test]
    fn test_images_always_written_as_list() {
        let data = sample();
        let (_, markers) = to_records(&data);
        let json = serde_json::to_value(&markers[1]).unwrap();
        assert_eq!(json["imageData"], serde_json::json!([]));
    }

    #[test]
    fn test_export_import_round_trip() {
        let data = sample();
        let doc = ExportDocument::new(&data, &Settings::default());
        assert_eq!(doc.version, "1.0");

        let parsed = ExportDocument::parse(&doc.to_json().unwrap()).unwrap();
        let (imported, settings) = parsed.into_data();
        assert_eq!(imported, data);
        assert_eq!(settings.unwrap().alert_interval, Some(30));
    }

    #[test]
    fn test_import_missing_groups_rejected() {
        let err = ExportDocument::parse(r#"{"version": "1.0", "markers": []}"#).unwrap_err();
        assert!(matches!(err, PersistError::Parse(msg) if msg.contains("groups")));

        assert!(matches!(ExportDocument::parse("not json"), Err(PersistError::Parse(_))));
    }

    #[test]
    fn test_import_duplicate_ids_rejected() {
        let markers = r#"{"version": "1.0", "groups": [{"id": "g1", "name": "A", "subgroups": []}],
            "markers": [
                {"id": "m1", "name": "A", "lat": 1.0, "lng": 2.0, "groupId": "g1"},
                {"id": "m1", "name": "B", "lat": 1.0, "lng": 2.0, "groupId": "g1"}
            ]}"#;
        let err = ExportDocument::parse(markers).unwrap_err();
        assert!(matches!(err, PersistError::Parse(msg) if msg.contains("duplicate marker id 'm1'")));

        let subgroups = r#"{"version": "1.0", "markers": [], "groups": [
            {"id": "g1", "name": "A", "subgroups": [{"id": "s1", "name": "X", "groupId": "g1"}]},
            {"id": "g2", "name": "B", "subgroups": [{"id": "s1", "name": "Y", "groupId": "g2"}]}
        ]}"#;
        let err = ExportDocument::parse(subgroups).unwrap_err();
        assert!(matches!(err, PersistError::Parse(msg) if msg.contains("subgroup")));
    }

    #[test]
    fn test_export_settings_overlay() {
        let mut settings = Settings::default();
        ExportSettings {
            alert_distance: Some(300),
            alert_interval: None,
            enable_notifications: Some(false),
        }
        .apply_to(&mut settings);
        assert_eq!(settings.alert_distance, 300);
        assert_eq!(settings.alert_interval, 30);
        assert!(!settings.enable_notifications);
    }
}
