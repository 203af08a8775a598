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

//! Map marker library with live position tracking and proximity alerts.
//!
//! The crate is split into layers that can be used on their own or through
//! the [`Session`] type that wires them together:
//!
//! - **Model**: groups, subgroups and markers with validated, all-or-nothing
//!   mutations
//! - **Filter**: selection of the visible marker subset
//! - **Position**: location sources (TCP NMEA/CSV feed, scripted replay) and a
//!   tracker that normalizes fixes and derives speed
//! - **Proximity**: the in-range/out-of-range state machine with cancellable
//!   repeat-alert timers
//! - **Alert**: fan-out of one alert to notification, popup, haptic and audio
//!   channels
//! - **Persistence**: local snapshot, JSON export/import and remote sync
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use waymark_core::{
//!     AlertDispatcher, FeedConfig, FeedSource, Marker, Session, Settings,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut session = Session::new(Settings::default(), AlertDispatcher::new());
//!     let group = session.create_group("Hiking");
//!     let summit = Marker::new("Summit", 25.0330, 121.5654, &group);
//!     let summit_id = summit.id.clone();
//!     session.add_marker(summit).unwrap();
//!     session.track_marker(&summit_id).unwrap();
//!
//!     let feed = FeedSource::new(FeedConfig {
//!         address: "localhost:2947".to_string(),
//!         ..Default::default()
//!     });
//!     session.start_tracking(Arc::new(feed));
//!
//!     let mut events = session.monitor().subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! }
//! ```
//!
//! # Using Individual Layers
//!
//! ```
//! use waymark_core::{distance_meters, resolve_visible_markers, Filter, MapData, Marker};
//!
//! let mut data = MapData::new();
//! let group = data.create_group("Food").id.clone();
//! data.add_marker(Marker::new("Cafe", 25.0, 121.0, &group)).unwrap();
//!
//! let visible = resolve_visible_markers(data.markers(), &Filter::Group(group), None, None);
//! assert_eq!(visible.len(), 1);
//! assert!(distance_meters(25.0, 121.0, 25.0, 121.0) < f64::EPSILON);
//! ```

pub mod alert;
pub mod filter;
pub mod geo;
pub mod model;
pub mod persistence;
pub mod position;
pub mod proximity;
pub mod remote;
pub mod session;
pub mod settings;

pub use alert::{Alert, AlertChannel, AlertDispatcher, AlertError, DispatchReport};
pub use filter::{resolve_visible_markers, Filter};
pub use geo::distance_meters;
pub use model::{EntityKind, Group, ImageRef, MapData, Marker, MarkerColor, ModelError, Subgroup};
pub use persistence::{ExportDocument, FileStore, LocalPersistence, LocalStore, MemoryStore, PersistError, SavedState};
pub use position::{
    FeedConfig, FeedSource, Fix, LocationError, LocationSource, PositionRecord, PositionTracker,
    ScriptedSource, WatchOptions,
};
pub use proximity::{ProximityEvent, ProximityMonitor, RangeState};
pub use remote::{RemoteError, RemoteGateway, RemoteStore, RemoteTables, RestConfig, RestRemote, SyncReport};
pub use session::Session;
pub use settings::{Settings, SettingsError};
