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

//! Visible-marker selection.

use crate::model::Marker;

/// Transient marker filter chosen in the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Filter {
    /// No explicit filter; fall back to the current group/subgroup selection.
    #[default]
    None,
    /// Exactly one marker.
    Marker(String),
    /// Every marker in a group, including those in its subgroups.
    Group(String),
    /// Every marker in a subgroup.
    Subgroup(String),
}

impl Filter {
    /// Whether this filter names the given id.
    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        match self {
            Self::None => false,
            Self::Marker(f) | Self::Group(f) | Self::Subgroup(f) => f == id,
        }
    }
}

/// Compute the markers that should be shown.
///
/// Pure: the same inputs always produce the same output and `all` is never
/// modified.
#[must_use]
pub fn resolve_visible_markers<'a>(
    all: &'a [Marker],
    filter: &Filter,
    current_group: Option<&str>,
    current_subgroup: Option<&str>,
) -> Vec<&'a Marker> {
    match filter {
        Filter::Marker(id) => all.iter().filter(|m| &m.id == id).collect(),
        Filter::Group(id) => all.iter().filter(|m| &m.group_id == id).collect(),
        Filter::Subgroup(id) => all
            .iter()
            .filter(|m| m.subgroup_id.as_ref() == Some(id))
            .collect(),
        Filter::None => match (current_group, current_subgroup) {
            (Some(group), Some(subgroup)) => all
                .iter()
                .filter(|m| m.group_id == group && m.subgroup_id.as_deref() == Some(subgroup))
                .collect(),
            (Some(group), None) => all.iter().filter(|m| m.group_id == group).collect(),
            (None, _) => all.iter().collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<Marker> {
        vec![
            Marker::with_id("m1", "A", 0.0, 0.0, "g1").in_subgroup("s1"),
            Marker::with_id("m2", "B", 0.0, 0.0, "g1"),
            Marker::with_id("m3", "C", 0.0, 0.0, "g2").in_subgroup("s2"),
        ]
    }

    fn ids(v: &[&Marker]) -> Vec<String> {
        v.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn test_marker_filter() {
        let all = markers();
        assert_eq!(ids(&resolve_visible_markers(&all, &Filter::Marker("m2".into()), None, None)), ["m2"]);
        assert!(resolve_visible_markers(&all, &Filter::Marker("gone".into()), None, None).is_empty());
    }

    #[test]
    fn test_group_filter_includes_subgroups() {
        let all = markers();
        let visible = resolve_visible_markers(&all, &Filter::Group("g1".into()), None, None);
        assert_eq!(ids(&visible), ["m1", "m2"]);
    }

    #[test]
    fn test_subgroup_filter() {
        let all = markers();
        let visible = resolve_visible_markers(&all, &Filter::Subgroup("s2".into()), Some("g1"), None);
        assert_eq!(ids(&visible), ["m3"]);
    }

    #[test]
    fn test_none_falls_back_to_selection() {
        let all = markers();
        assert_eq!(resolve_visible_markers(&all, &Filter::None, None, None).len(), 3);
        assert_eq!(ids(&resolve_visible_markers(&all, &Filter::None, Some("g1"), None)), ["m1", "m2"]);
        assert_eq!(ids(&resolve_visible_markers(&all, &Filter::None, Some("g1"), Some("s1"))), ["m1"]);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let all = markers();
        let before = all.clone();
        let filter = Filter::Group("g2".into());
        let first = ids(&resolve_visible_markers(&all, &filter, None, None));
        let second = ids(&resolve_visible_markers(&all, &filter, None, None));
        assert_eq!(first, second);
        assert_eq!(all, before);
    }
}
