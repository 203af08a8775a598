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

//! Group, subgroup and marker entities.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::distance_meters;

/// Maximum number of images a marker may carry.
pub const MAX_MARKER_IMAGES: usize = 3;

/// Default marker glyph.
pub const DEFAULT_MARKER_ICON: &str = "📍";

/// Prefix that identifies an inline (not yet uploaded) image payload.
const INLINE_IMAGE_PREFIX: &str = "data:image/";

/// Generate a fresh entity id.
#[must_use]
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

/// Marker pin color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerColor {
    #[default]
    Red,
    Blue,
    Green,
    Orange,
    Purple,
    Yellow,
}

impl MarkerColor {
    pub const ALL: [MarkerColor; 6] = [
        MarkerColor::Red,
        MarkerColor::Blue,
        MarkerColor::Green,
        MarkerColor::Orange,
        MarkerColor::Purple,
        MarkerColor::Yellow,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Orange => "orange",
            Self::Purple => "purple",
            Self::Yellow => "yellow",
        }
    }
}

impl fmt::Display for MarkerColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown marker color '{s}'"))
    }
}

/// A marker image: either an inline data URL awaiting upload, or a URL.
///
/// Serialized as a bare string; the variant is recovered from the
/// `data:image/` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImageRef {
    /// Base64 data URL (`data:image/jpeg;base64,...`).
    Inline(String),
    /// Reference to an already stored image.
    Url(String),
}

impl ImageRef {
    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline(_))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inline(s) | Self::Url(s) => s,
        }
    }
}

impl From<String> for ImageRef {
    fn from(value: String) -> Self {
        if value.starts_with(INLINE_IMAGE_PREFIX) {
            Self::Inline(value)
        } else {
            Self::Url(value)
        }
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        match value {
            ImageRef::Inline(s) | ImageRef::Url(s) => s,
        }
    }
}

/// A user-placed point of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub id: String,
    pub name: String,
    pub description: String,
    pub lat: f64,
    pub lng: f64,
    pub group_id: String,
    pub subgroup_id: Option<String>,
    pub color: MarkerColor,
    pub icon: String,
    /// Ordered list of up to [`MAX_MARKER_IMAGES`] images.
    pub images: Vec<ImageRef>,
}

impl Marker {
    /// Create a marker with a generated id, default color and icon.
    pub fn new(name: impl Into<String>, lat: f64, lng: f64, group_id: impl Into<String>) -> Self {
        Self::with_id(new_entity_id(), name, lat, lng, group_id)
    }

    /// Create a marker with a caller-supplied id.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        lat: f64,
        lng: f64,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            lat,
            lng,
            group_id: group_id.into(),
            subgroup_id: None,
            color: MarkerColor::default(),
            icon: DEFAULT_MARKER_ICON.to_string(),
            images: Vec::new(),
        }
    }

    #[must_use]
    pub fn in_subgroup(mut self, subgroup_id: impl Into<String>) -> Self {
        self.subgroup_id = Some(subgroup_id.into());
        self
    }

    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn colored(mut self, color: MarkerColor) -> Self {
        self.color = color;
        self
    }

    /// Distance in meters from a given point to this marker.
    #[must_use]
    pub fn distance_from(&self, lat: f64, lng: f64) -> f64 {
        distance_meters(lat, lng, self.lat, self.lng)
    }

    /// Tag used to collapse repeated notifications for this marker.
    #[must_use]
    pub fn alert_tag(&self) -> String {
        format!("location-alert-{}", self.id)
    }
}

/// Second-level container, owned by a [`Group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subgroup {
    pub id: String,
    pub name: String,
    pub group_id: String,
    pub marker_refs: HashSet<String>,
}

impl Subgroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            group_id: group_id.into(),
            marker_refs: HashSet::new(),
        }
    }
}

/// Top-level marker container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Subgroups in insertion order.
    pub subgroups: Vec<Subgroup>,
    pub marker_refs: HashSet<String>,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subgroups: Vec::new(),
            marker_refs: HashSet::new(),
        }
    }

    #[must_use]
    pub fn subgroup(&self, subgroup_id: &str) -> Option<&Subgroup> {
        self.subgroups.iter().find(|s| s.id == subgroup_id)
    }

    pub fn subgroup_mut(&mut self, subgroup_id: &str) -> Option<&mut Subgroup> {
        self.subgroups.iter_mut().find(|s| s.id == subgroup_id)
    }

    /// Drop a marker id from this group and all of its subgroups.
    pub(crate) fn forget_marker(&mut self, marker_id: &str) {
        self.marker_refs.remove(marker_id);
        for subgroup in &mut self.subgroups {
            subgroup.marker_refs.remove(marker_id);
        }
    }
}
