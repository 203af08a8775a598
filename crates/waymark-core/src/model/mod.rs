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

//! Hierarchical marker data model.
//!
//! [`MapData`] owns the flat marker collection and the group/subgroup tree.
//! Every mutation validates first and only then touches state, so a rejected
//! call never leaves a partial write behind.

mod entity;

use std::collections::HashSet;
use std::fmt;

use log::{info, warn};
use thiserror::Error;

pub use entity::{
    new_entity_id, Group, ImageRef, Marker, MarkerColor, Subgroup, DEFAULT_MARKER_ICON,
    MAX_MARKER_IMAGES,
};

/// Kind of entity referenced by an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Group,
    Subgroup,
    Marker,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Group => "group",
            Self::Subgroup => "subgroup",
            Self::Marker => "marker",
        })
    }
}

/// Errors raised by data model operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("consistency violation: {0}")]
    Consistency(String),
}

impl ModelError {
    fn not_found(kind: EntityKind, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Groups, subgroups and markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapData {
    groups: Vec<Group>,
    markers: Vec<Marker>,
}

impl MapData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts, attaching each marker to its containers.
    ///
    /// Markers whose group or subgroup cannot be resolved stay in the flat
    /// collection but are not attached. Entities repeating an earlier id are
    /// dropped. The ids of unattached and dropped markers are returned.
    #[must_use]
    pub fn from_parts(groups: Vec<Group>, markers: Vec<Marker>) -> (Self, Vec<String>) {
        let mut data = Self {
            groups: Vec::with_capacity(groups.len()),
            markers: Vec::with_capacity(markers.len()),
        };
        let mut group_ids = HashSet::new();
        let mut subgroup_ids = HashSet::new();
        for mut group in groups {
            if !group_ids.insert(group.id.clone()) {
                warn!("Dropping duplicate group {}", group.id);
                continue;
            }
            group.marker_refs.clear();
            group.subgroups.retain_mut(|subgroup| {
                if subgroup_ids.insert(subgroup.id.clone()) {
                    subgroup.marker_refs.clear();
                    true
                } else {
                    warn!("Dropping duplicate subgroup {}", subgroup.id);
                    false
                }
            });
            data.groups.push(group);
        }

        let mut marker_ids = HashSet::new();
        let mut dangling = Vec::new();
        for marker in markers {
            if !marker_ids.insert(marker.id.clone()) {
                warn!("Dropping duplicate marker {}", marker.id);
                dangling.push(marker.id);
                continue;
            }
            if data.check_placement(&marker.group_id, marker.subgroup_id.as_deref()).is_ok() {
                data.attach(&marker);
            } else {
                warn!(
                    "Marker {} references missing group {} / subgroup {:?}; keeping it unattached",
                    marker.id, marker.group_id, marker.subgroup_id
                );
                dangling.push(marker.id.clone());
            }
            data.markers.push(marker);
        }
        (data, dangling)
    }

    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    #[must_use]
    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == group_id)
    }

    #[must_use]
    pub fn marker(&self, marker_id: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.id == marker_id)
    }

    /// Find a subgroup by id regardless of which group owns it.
    #[must_use]
    pub fn find_subgroup(&self, subgroup_id: &str) -> Option<&Subgroup> {
        self.groups.iter().find_map(|g| g.subgroup(subgroup_id))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.markers.is_empty()
    }

    /// Create a group with a generated id.
    pub fn create_group(&mut self, name: impl Into<String>) -> &Group {
        let group = Group::new(new_entity_id(), name);
        info!("Created group '{}' ({})", group.name, group.id);
        self.groups.push(group);
        &self.groups[self.groups.len() - 1]
    }

    /// Insert a group with a caller-supplied id.
    pub fn insert_group(&mut self, group: Group) -> Result<(), ModelError> {
        if self.group(&group.id).is_some() {
            return Err(ModelError::Consistency(format!(
                "duplicate group id {}",
                group.id
            )));
        }
        if let Some(sg) = group.subgroups.iter().find(|s| s.group_id != group.id) {
            return Err(ModelError::Consistency(format!(
                "subgroup {} claims group {} but is owned by {}",
                sg.id, sg.group_id, group.id
            )));
        }
        self.groups.push(group);
        Ok(())
    }

    /// Remove a group with all of its subgroups and markers.
    ///
    /// Returns the markers that were removed along with it.
    pub fn remove_group(&mut self, group_id: &str) -> Result<Vec<Marker>, ModelError> {
        let pos = self
            .groups
            .iter()
            .position(|g| g.id == group_id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Group, group_id))?;
        let group = self.groups.remove(pos);

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.markers)
            .into_iter()
            .partition(|m| m.group_id == group_id);
        self.markers = kept;

        info!(
            "Removed group '{}' ({}) with {} subgroups and {} markers",
            group.name,
            group.id,
            group.subgroups.len(),
            removed.len()
        );
        Ok(removed)
    }

    pub fn add_subgroup(
        &mut self,
        group_id: &str,
        name: impl Into<String>,
    ) -> Result<&Subgroup, ModelError> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Group, group_id))?;
        let subgroup = Subgroup::new(new_entity_id(), name, group_id);
        info!("Created subgroup '{}' ({}) in group {}", subgroup.name, subgroup.id, group_id);
        group.subgroups.push(subgroup);
        Ok(&group.subgroups[group.subgroups.len() - 1])
    }

    /// Insert a subgroup with a caller-supplied id into its owning group.
    pub fn insert_subgroup(&mut self, subgroup: Subgroup) -> Result<(), ModelError> {
        if self.find_subgroup(&subgroup.id).is_some() {
            return Err(ModelError::Consistency(format!(
                "duplicate subgroup id {}",
                subgroup.id
            )));
        }
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.id == subgroup.group_id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Group, &subgroup.group_id))?;
        group.subgroups.push(subgroup);
        Ok(())
    }

    /// Remove a subgroup, detaching its markers.
    ///
    /// Markers assigned to the subgroup keep existing with `subgroup_id = None`.
    /// Returns the ids of the detached markers.
    pub fn remove_subgroup(
        &mut self,
        group_id: &str,
        subgroup_id: &str,
    ) -> Result<Vec<String>, ModelError> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Group, group_id))?;
        let pos = group
            .subgroups
            .iter()
            .position(|s| s.id == subgroup_id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Subgroup, subgroup_id))?;
        group.subgroups.remove(pos);

        let mut detached = Vec::new();
        for marker in &mut self.markers {
            if marker.subgroup_id.as_deref() == Some(subgroup_id) {
                marker.subgroup_id = None;
                detached.push(marker.id.clone());
            }
        }
        info!(
            "Removed subgroup {} from group {}; detached {} markers",
            subgroup_id,
            group_id,
            detached.len()
        );
        Ok(detached)
    }

    pub fn add_marker(&mut self, marker: Marker) -> Result<(), ModelError> {
        if self.marker(&marker.id).is_some() {
            return Err(ModelError::Consistency(format!(
                "duplicate marker id {}",
                marker.id
            )));
        }
        Self::check_images(&marker)?;
        self.check_placement(&marker.group_id, marker.subgroup_id.as_deref())?;

        self.attach(&marker);
        info!("Added marker '{}' ({}) to group {}", marker.name, marker.id, marker.group_id);
        self.markers.push(marker);
        Ok(())
    }

    pub fn remove_marker(&mut self, marker_id: &str) -> Result<Marker, ModelError> {
        let pos = self
            .markers
            .iter()
            .position(|m| m.id == marker_id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Marker, marker_id))?;
        let marker = self.markers.remove(pos);
        for group in &mut self.groups {
            group.forget_marker(marker_id);
        }
        info!("Removed marker '{}' ({})", marker.name, marker.id);
        Ok(marker)
    }

    /// Move a marker to another group and/or subgroup.
    pub fn reparent_marker(
        &mut self,
        marker_id: &str,
        new_group_id: &str,
        new_subgroup_id: Option<&str>,
    ) -> Result<(), ModelError> {
        let mut updated = self
            .marker(marker_id)
            .cloned()
            .ok_or_else(|| ModelError::not_found(EntityKind::Marker, marker_id))?;
        updated.group_id = new_group_id.to_string();
        updated.subgroup_id = new_subgroup_id.map(str::to_string);
        self.update_marker(updated).map(|_| ())
    }

    /// Replace a marker (matched by id), re-linking containers if its
    /// group or subgroup changed. Returns the previous version.
    pub fn update_marker(&mut self, updated: Marker) -> Result<Marker, ModelError> {
        let pos = self
            .markers
            .iter()
            .position(|m| m.id == updated.id)
            .ok_or_else(|| ModelError::not_found(EntityKind::Marker, &updated.id))?;
        Self::check_images(&updated)?;
        self.check_placement(&updated.group_id, updated.subgroup_id.as_deref())?;

        for group in &mut self.groups {
            group.forget_marker(&updated.id);
        }
        self.attach(&updated);
        Ok(std::mem::replace(&mut self.markers[pos], updated))
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.markers.clear();
    }

    fn check_images(marker: &Marker) -> Result<(), ModelError> {
        if marker.images.len() > MAX_MARKER_IMAGES {
            return Err(ModelError::Consistency(format!(
                "marker {} has {} images (max {})",
                marker.id,
                marker.images.len(),
                MAX_MARKER_IMAGES
            )));
        }
        Ok(())
    }

    /// Validate that a group exists and that the subgroup, if any, belongs to it.
    fn check_placement(&self, group_id: &str, subgroup_id: Option<&str>) -> Result<(), ModelError> {
        if self.group(group_id).is_none() {
            return Err(ModelError::not_found(EntityKind::Group, group_id));
        }
        if let Some(subgroup_id) = subgroup_id {
            let subgroup = self
                .find_subgroup(subgroup_id)
                .ok_or_else(|| ModelError::not_found(EntityKind::Subgroup, subgroup_id))?;
            if subgroup.group_id != group_id {
                return Err(ModelError::Consistency(format!(
                    "subgroup {} belongs to group {}, not {}",
                    subgroup_id, subgroup.group_id, group_id
                )));
            }
        }
        Ok(())
    }

    /// Add back-references for an already validated marker.
    fn attach(&mut self, marker: &Marker) {
        if let Some(group) = self.groups.iter_mut().find(|g| g.id == marker.group_id) {
            group.marker_refs.insert(marker.id.clone());
            if let Some(subgroup_id) = marker.subgroup_id.as_deref() {
                if let Some(subgroup) = group.subgroup_mut(subgroup_id) {
                    subgroup.marker_refs.insert(marker.id.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (MapData, String, String) {
        let mut data = MapData::new();
        let group_id = data.create_group("Hiking").id.clone();
        let subgroup_id = data.add_subgroup(&group_id, "Trail").unwrap().id.clone();
        (data, group_id, subgroup_id)
    }

    #[test]
    fn test_add_marker_links_containers() {
        let (mut data, group_id, subgroup_id) = sample();
        let marker = Marker::new("Summit", 25.0, 121.5, &group_id).in_subgroup(&subgroup_id);
        let marker_id = marker.id.clone();
        data.add_marker(marker).unwrap();

        let group = data.group(&group_id).unwrap();
        assert!(group.marker_refs.contains(&marker_id));
        assert!(group.subgroup(&subgroup_id).unwrap().marker_refs.contains(&marker_id));
    }

    #[test]
    fn test_add_marker_unknown_group_rejected() {
        let (mut data, _, _) = sample();
        let err = data.add_marker(Marker::new("X", 0.0, 0.0, "nope")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound { kind: EntityKind::Group, .. }));
        assert!(data.markers().is_empty());
    }

    #[test]
    fn test_add_marker_subgroup_of_other_group_rejected() {
        let (mut data, _, subgroup_id) = sample();
        let other = data.create_group("Food").id.clone();
        let before = data.clone();
        let err = data
            .add_marker(Marker::new("X", 0.0, 0.0, &other).in_subgroup(&subgroup_id))
            .unwrap_err();
        assert!(matches!(err, ModelError::Consistency(_)));
        assert_eq!(data, before);
    }

    #[test]
    fn test_too_many_images_rejected() {
        let (mut data, group_id, _) = sample();
        let mut marker = Marker::new("X", 0.0, 0.0, &group_id);
        marker.images = (0..4).map(|i| ImageRef::Url(format!("https://x/{i}.jpg"))).collect();
        assert!(matches!(data.add_marker(marker), Err(ModelError::Consistency(_))));
    }

    #[test]
    fn test_remove_marker_purges_refs() {
        let (mut data, group_id, subgroup_id) = sample();
        let marker = Marker::new("Summit", 25.0, 121.5, &group_id).in_subgroup(&subgroup_id);
        let marker_id = marker.id.clone();
        data.add_marker(marker).unwrap();

        data.remove_marker(&marker_id).unwrap();
        assert!(data.marker(&marker_id).is_none());
        for group in data.groups() {
            assert!(!group.marker_refs.contains(&marker_id));
            for sg in &group.subgroups {
                assert!(!sg.marker_refs.contains(&marker_id));
            }
        }
        assert!(matches!(
            data.remove_marker(&marker_id),
            Err(ModelError::NotFound { kind: EntityKind::Marker, .. })
        ));
    }

    #[test]
    fn test_remove_subgroup_detaches_markers() {
        let (mut data, group_id, subgroup_id) = sample();
        let marker = Marker::new("Summit", 25.0, 121.5, &group_id).in_subgroup(&subgroup_id);
        let marker_id = marker.id.clone();
        data.add_marker(marker).unwrap();

        let detached = data.remove_subgroup(&group_id, &subgroup_id).unwrap();
        assert_eq!(detached, vec![marker_id.clone()]);

        let marker = data.marker(&marker_id).unwrap();
        assert!(marker.subgroup_id.is_none());
        assert!(data.group(&group_id).unwrap().marker_refs.contains(&marker_id));
        assert!(data.find_subgroup(&subgroup_id).is_none());
    }

    #[test]
    fn test_remove_group_cascades() {
        let (mut data, group_id, subgroup_id) = sample();
        let other = data.create_group("Food").id.clone();
        data.add_marker(Marker::new("A", 0.0, 0.0, &group_id).in_subgroup(&subgroup_id))
            .unwrap();
        data.add_marker(Marker::new("B", 0.0, 0.0, &other)).unwrap();

        let removed = data.remove_group(&group_id).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(data.markers().len(), 1);
        assert!(data.group(&group_id).is_none());
        assert!(data.find_subgroup(&subgroup_id).is_none());
    }

    #[test]
    fn test_reparent_marker() {
        let (mut data, group_id, subgroup_id) = sample();
        let other = data.create_group("Food").id.clone();
        let marker = Marker::new("A", 0.0, 0.0, &group_id).in_subgroup(&subgroup_id);
        let marker_id = marker.id.clone();
        data.add_marker(marker).unwrap();

        data.reparent_marker(&marker_id, &other, None).unwrap();
        assert_eq!(data.marker(&marker_id).unwrap().group_id, other);
        assert!(!data.group(&group_id).unwrap().marker_refs.contains(&marker_id));
        assert!(!data.find_subgroup(&subgroup_id).unwrap().marker_refs.contains(&marker_id));
        assert!(data.group(&other).unwrap().marker_refs.contains(&marker_id));
    }

    #[test]
    fn test_reparent_marker_inconsistent_is_atomic() {
        let (mut data, group_id, subgroup_id) = sample();
        let other = data.create_group("Food").id.clone();
        let marker = Marker::new("A", 0.0, 0.0, &group_id);
        let marker_id = marker.id.clone();
        data.add_marker(marker).unwrap();
        let before = data.clone();

        let err = data.reparent_marker(&marker_id, &other, Some(&subgroup_id)).unwrap_err();
        assert!(matches!(err, ModelError::Consistency(_)));
        assert_eq!(data, before);

        let err = data.reparent_marker(&marker_id, &group_id, Some("ghost")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound { kind: EntityKind::Subgroup, .. }));
        assert_eq!(data, before);
    }

    #[test]
    fn test_from_parts_keeps_dangling_markers() {
        let group = Group::new("g1", "Hiking");
        let ok = Marker::with_id("m1", "A", 0.0, 0.0, "g1");
        let dangling = Marker::with_id("m2", "B", 0.0, 0.0, "g-missing");
        let bad_sub = Marker::with_id("m3", "C", 0.0, 0.0, "g1").in_subgroup("s-missing");

        let (data, unattached) = MapData::from_parts(vec![group], vec![ok, dangling, bad_sub]);
        assert_eq!(data.markers().len(), 3);
        assert_eq!(unattached, vec!["m2".to_string(), "m3".to_string()]);
        let group = data.group("g1").unwrap();
        assert!(group.marker_refs.contains("m1"));
        assert!(!group.marker_refs.contains("m3"));
    }

    #[test]
    fn test_from_parts_drops_duplicate_ids() {
        let mut first = Group::new("g1", "Hiking");
        first.subgroups.push(Subgroup::new("s1", "Peaks", "g1"));
        let mut second = Group::new("g2", "Food");
        second.subgroups.push(Subgroup::new("s1", "Cafes", "g2"));
        let repeated = Group::new("g1", "Other");
        let markers = vec![
            Marker::with_id("m1", "A", 0.0, 0.0, "g1"),
            Marker::with_id("m1", "B", 0.0, 0.0, "g2"),
        ];

        let (mut data, unattached) = MapData::from_parts(vec![first, second, repeated], markers);
        assert_eq!(data.groups().len(), 2);
        assert_eq!(data.group("g1").unwrap().name, "Hiking");
        assert!(data.group("g2").unwrap().subgroups.is_empty());
        assert_eq!(data.markers().len(), 1);
        assert_eq!(data.marker("m1").unwrap().name, "A");
        assert_eq!(unattached, vec!["m1".to_string()]);

        data.remove_marker("m1").unwrap();
        assert!(data.markers().iter().all(|m| m.id != "m1"));
    }

    #[test]
    fn test_insert_group_duplicate_rejected() {
        let mut data = MapData::new();
        data.insert_group(Group::new("g1", "A")).unwrap();
        assert!(matches!(
            data.insert_group(Group::new("g1", "B")),
            Err(ModelError::Consistency(_))
        ));
    }
}
