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

//! Remote backend synchronization.
//!
//! [`RemoteGateway`] maps the data model onto three tables (markers, groups,
//! subgroups) of a [`RemoteStore`], scoped by an optional dataset group.
//! Records are upserted by id, so re-sending an unchanged entity leaves the
//! remote state as it was.
//!
//! Inline marker images are uploaded to object storage before the marker row
//! is written. If any upload fails the row is not written at all.

mod rest;

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{ImageRef, MapData, Marker, MarkerColor};
use crate::persistence::{deserialize_images, from_records, GroupRecord, MarkerRecord, SubgroupRecord};

pub use rest::{RestConfig, RestRemote};

/// Dataset holding shared live positions.
pub const LIVE_DATASET: &str = "realtime_tracking";
const LIVE_SUBGROUP: &str = "tracking";
const CONFLICT_KEY: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("image upload failed for {filename}: {reason}")]
    Upload { filename: String, reason: String },

    #[error("sync with table '{table}' failed: {reason}")]
    Sync { table: String, reason: String },

    #[error("invalid inline image: {0}")]
    InvalidImage(String),
}

/// Table and object storage operations of the backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert(&self, table: &str, record: Value, conflict_key: &str) -> Result<(), RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    /// Select all rows, optionally where `column == value`.
    async fn select(&self, table: &str, filter: Option<(&str, &str)>) -> Result<Vec<Value>, RemoteError>;

    /// Store `bytes` under `filename` and return its public URL.
    async fn upload(&self, bytes: Vec<u8>, filename: &str, content_type: &str) -> Result<String, RemoteError>;
}

/// Table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTables {
    pub markers: String,
    pub groups: String,
    pub subgroups: String,
}

impl Default for RemoteTables {
    fn default() -> Self {
        Self {
            markers: "markers".to_string(),
            groups: "groups".to_string(),
            subgroups: "subgroups".to_string(),
        }
    }
}

/// Tally of a batch sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub success: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record<T>(&mut self, result: &Result<T, RemoteError>) {
        match result {
            Ok(_) => self.success += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// A shared live position read back from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LivePosition {
    pub team: String,
    pub lat: f64,
    pub lng: f64,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarkerRow {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    lat: f64,
    lng: f64,
    group_id: String,
    #[serde(default)]
    subgroup_id: Option<String>,
    #[serde(default)]
    color: Option<MarkerColor>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default, deserialize_with = "deserialize_images")]
    image_data: Vec<ImageRef>,
    #[serde(default)]
    dataset_group: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SubgroupRow {
    id: String,
    name: String,
    group_id: String,
}

/// Maps model entities onto a [`RemoteStore`].
#[derive(Debug)]
pub struct RemoteGateway<R> {
    store: R,
    tables: RemoteTables,
    dataset_group: Option<String>,
}

impl<R: RemoteStore> RemoteGateway<R> {
    pub fn new(store: R, tables: RemoteTables, dataset_group: Option<String>) -> Self {
        Self {
            store,
            tables,
            dataset_group: dataset_group.filter(|g| !g.is_empty()),
        }
    }

    #[must_use]
    pub fn dataset_group(&self) -> Option<&str> {
        self.dataset_group.as_deref()
    }

    pub fn set_dataset_group(&mut self, group: Option<String>) {
        self.dataset_group = group.filter(|g| !g.is_empty());
    }

    fn scope(&self) -> Option<(&str, &str)> {
        self.dataset_group.as_deref().map(|g| ("dataset_group", g))
    }

    /// Upload every inline image of `marker` and return the URL list.
    async fn upload_images(&self, marker: &Marker) -> Result<Vec<ImageRef>, RemoteError> {
        let mut urls = Vec::with_capacity(marker.images.len());
        for (index, image) in marker.images.iter().enumerate() {
            match image {
                ImageRef::Url(_) => urls.push(image.clone()),
                ImageRef::Inline(data_url) => {
                    let (mime, bytes) = decode_data_url(data_url)?;
                    let filename = image_filename(&marker.id, index, &mime, &bytes);
                    let url = self.store.upload(bytes, &filename, &mime).await?;
                    info!("Uploaded image {} for marker {}", filename, marker.id);
                    urls.push(ImageRef::Url(url));
                }
            }
        }
        Ok(urls)
    }

    /// Upsert a marker, uploading inline images first.
    ///
    /// Returns the marker as stored remotely (images replaced by URLs).
    pub async fn upsert_marker(&self, marker: &Marker) -> Result<Marker, RemoteError> {
        let images = self.upload_images(marker).await.inspect_err(|e| {
            error!("Not syncing marker {}: {}", marker.id, e);
        })?;

        let mut stored = marker.clone();
        stored.images = images;
        let record = json!({
            "id": stored.id,
            "name": stored.name,
            "description": stored.description,
            "lat": stored.lat,
            "lng": stored.lng,
            "group_id": stored.group_id,
            "subgroup_id": stored.subgroup_id,
            "color": stored.color,
            "icon": stored.icon,
            "image_data": stored.images,
            "dataset_group": self.dataset_group,
        });
        self.store.upsert(&self.tables.markers, record, CONFLICT_KEY).await?;
        info!("Synced marker '{}' ({})", stored.name, stored.id);
        Ok(stored)
    }

    pub async fn upsert_group(&self, id: &str, name: &str) -> Result<(), RemoteError> {
        let record = json!({ "id": id, "name": name, "dataset_group": self.dataset_group });
        self.store.upsert(&self.tables.groups, record, CONFLICT_KEY).await
    }

    pub async fn upsert_subgroup(&self, id: &str, name: &str, group_id: &str) -> Result<(), RemoteError> {
        let record = json!({
            "id": id,
            "name": name,
            "group_id": group_id,
            "dataset_group": self.dataset_group,
        });
        self.store.upsert(&self.tables.subgroups, record, CONFLICT_KEY).await
    }

    pub async fn delete_marker(&self, id: &str) -> Result<(), RemoteError> {
        self.store.delete(&self.tables.markers, id).await
    }

    pub async fn delete_group(&self, id: &str) -> Result<(), RemoteError> {
        self.store.delete(&self.tables.groups, id).await
    }

    pub async fn delete_subgroup(&self, id: &str) -> Result<(), RemoteError> {
        self.store.delete(&self.tables.subgroups, id).await
    }

    /// Push every marker, continuing past failures.
    pub async fn sync_all_markers(&self, data: &MapData) -> SyncReport {
        let mut report = SyncReport::default();
        for marker in data.markers() {
            let result = self.upsert_marker(marker).await;
            if let Err(e) = &result {
                warn!("Failed to sync marker {}: {}", marker.id, e);
            }
            report.record(&result);
        }
        info!("Marker sync: {} ok, {} failed", report.success, report.failed);
        report
    }

    /// Push every group followed by its subgroups, continuing past failures.
    pub async fn sync_all_groups(&self, data: &MapData) -> SyncReport {
        let mut report = SyncReport::default();
        for group in data.groups() {
            let result = self.upsert_group(&group.id, &group.name).await;
            if let Err(e) = &result {
                warn!("Failed to sync group {}: {}", group.id, e);
            }
            report.record(&result);

            for subgroup in &group.subgroups {
                let result = self.upsert_subgroup(&subgroup.id, &subgroup.name, &group.id).await;
                if let Err(e) = &result {
                    warn!("Failed to sync subgroup {}: {}", subgroup.id, e);
                }
                report.record(&result);
            }
        }
        info!("Group sync: {} ok, {} failed", report.success, report.failed);
        report
    }

    /// Fetch groups, subgroups and markers of the current dataset.
    pub async fn fetch_all(&self) -> Result<MapData, RemoteError> {
        let group_rows: Vec<GroupRow> = self.select_rows(&self.tables.groups).await?;
        let subgroup_rows: Vec<SubgroupRow> = self.select_rows(&self.tables.subgroups).await?;
        let marker_rows: Vec<MarkerRow> = self.select_rows(&self.tables.markers).await?;

        let mut subgroups: HashMap<String, Vec<SubgroupRecord>> = HashMap::new();
        for row in subgroup_rows {
            subgroups.entry(row.group_id.clone()).or_default().push(SubgroupRecord {
                id: row.id,
                name: row.name,
                group_id: row.group_id,
            });
        }
        let groups: Vec<GroupRecord> = group_rows
            .into_iter()
            .map(|g| GroupRecord {
                subgroups: subgroups.remove(&g.id).unwrap_or_default(),
                id: g.id,
                name: g.name,
            })
            .collect();
        for orphan in subgroups.values().flatten() {
            warn!("Skipping subgroup {} of unknown group {}", orphan.id, orphan.group_id);
        }

        let markers: Vec<MarkerRecord> = marker_rows
            .into_iter()
            .filter(|m| m.dataset_group.as_deref() != Some(LIVE_DATASET))
            .map(|m| MarkerRecord {
                id: m.id,
                name: m.name,
                description: m.description.unwrap_or_default(),
                lat: m.lat,
                lng: m.lng,
                group_id: m.group_id,
                subgroup_id: m.subgroup_id,
                color: m.color.unwrap_or_default(),
                icon: m.icon.unwrap_or_else(|| crate::model::DEFAULT_MARKER_ICON.to_string()),
                images: m.image_data,
            })
            .collect();

        let (data, dangling) = from_records(groups, markers);
        if !dangling.is_empty() {
            warn!("{} remote markers reference missing groups", dangling.len());
        }
        info!(
            "Fetched {} groups and {} markers",
            data.groups().len(),
            data.markers().len()
        );
        Ok(data)
    }

    async fn select_rows<T: for<'de> Deserialize<'de>>(&self, table: &str) -> Result<Vec<T>, RemoteError> {
        self.store
            .select(table, self.scope())
            .await?
            .into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| RemoteError::Sync {
                    table: table.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Share a team's live position in the live dataset.
    pub async fn upload_live_position(&self, team: &str, lat: f64, lng: f64) -> Result<(), RemoteError> {
        let (color, icon) = match team {
            "1" => (MarkerColor::Red, "1"),
            "2" => (MarkerColor::Blue, "2"),
            "3" => (MarkerColor::Green, "3"),
            _ => (MarkerColor::Orange, "?"),
        };
        let now = chrono::Utc::now();
        let record = json!({
            "id": format!("realtime_{team}"),
            "name": format!("Live position - team {team}"),
            "description": format!("Last update: {}", now.format("%H:%M:%S")),
            "lat": lat,
            "lng": lng,
            "group_id": team,
            "subgroup_id": LIVE_SUBGROUP,
            "color": color,
            "icon": icon,
            "dataset_group": LIVE_DATASET,
            "updated_at": now.to_rfc3339(),
        });
        self.store.upsert(&self.tables.markers, record, CONFLICT_KEY).await
    }

    pub async fn fetch_live_positions(&self) -> Result<Vec<LivePosition>, RemoteError> {
        let rows = self
            .store
            .select(&self.tables.markers, Some(("dataset_group", LIVE_DATASET)))
            .await?;
        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<MarkerRow>(row) {
                Ok(m) => positions.push(LivePosition {
                    team: m.group_id,
                    lat: m.lat,
                    lng: m.lng,
                    updated_at: m.updated_at,
                }),
                Err(e) => warn!("Skipping malformed live position row: {}", e),
            }
        }
        Ok(positions)
    }
}

/// Decode a `data:image/...;base64,` URL into its MIME type and bytes.
fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), RemoteError> {
    let (header, payload) = data_url
        .split_once(";base64,")
        .ok_or_else(|| RemoteError::InvalidImage("not a base64 data URL".to_string()))?;
    let mime = header
        .strip_prefix("data:")
        .filter(|m| m.starts_with("image/"))
        .ok_or_else(|| RemoteError::InvalidImage(format!("unsupported data URL type '{header}'")))?;
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| RemoteError::InvalidImage(e.to_string()))?;
    Ok((mime.to_ascii_lowercase(), bytes))
}

fn image_extension(mime: &str) -> &str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/svg+xml" => "svg",
        other => other.strip_prefix("image/").unwrap_or("bin"),
    }
}

/// Content-addressed object name, so re-uploading an image reuses its URL.
fn image_filename(marker_id: &str, index: usize, mime: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = format!("{:x}", hasher.finalize());
    format!("{}_{}_{}.{}", marker_id, index, &hash[..16], image_extension(mime))
}
