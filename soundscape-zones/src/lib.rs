//! Zone reconciliation for Soundscape peers.
//!
//! [`ZoneReconciler`] maps the shared zone list onto local render handles
//! and collision shapes, with zero-latency local creation and a pending
//! guard against premature deletion.  [`ProximityTracker`] turns the
//! reconciled shapes into throttled "what should be audible" updates.

pub mod config;
pub mod error;
pub mod geometry;
pub mod proximity;
pub mod reconciler;
pub mod renderer;
pub mod spatial;

pub use config::ZoneConfig;
pub use error::ZoneError;
pub use geometry::{GeometryAdapter, PlanarGeometry, PlanarShape};
pub use proximity::{ProximityTracker, SoundingSet, SoundingZone, ZoneHit, ZoneProximity};
pub use reconciler::{ReconcileReport, ZoneDraft, ZoneReconciler};
pub use renderer::{RecordingRenderer, RenderHandle, ZoneRenderer};
pub use spatial::{Aabb, SpatialHash};
