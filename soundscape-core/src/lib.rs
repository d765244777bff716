//! Shared data model for Soundscape sessions.
//!
//! Every peer in a session reads and writes the same replicated document:
//! one transport record (tempo / play state) and a map of geofenced sound
//! zones.  This crate holds the plain data types for those records, the
//! wall clock abstraction, and the [`document::SharedDocument`] seam with
//! its yrs-backed implementation.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub mod clock;
pub mod document;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{
    DocumentError, DocumentOp, DocumentSnapshot, SharedDocument, Subscription, YrsDocument,
};

/// Milliseconds since the Unix epoch, as reported by a peer's wall clock.
pub type Timestamp = i64;

/// Tempo used when nobody has set one yet.
pub const DEFAULT_BPM: f64 = 120.0;

/// Mean Earth radius in metres (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Lock a mutex, recovering the data if another holder panicked.
///
/// All state guarded in this workspace stays structurally valid between
/// statements, so a poisoned lock is still safe to read.
#[inline]
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Identity of a participating device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique zone identifier, minted by the creating peer.
///
/// The id never changes after creation.  Minting combines the creator's
/// millisecond timestamp with random bits so that peers never need to
/// coordinate to stay collision free.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    /// Mint a fresh id at local time `now`.
    pub fn mint(now: Timestamp) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("zone-{now:x}-{}", &suffix[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ZoneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ZoneId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// Shared transport record.
///
/// Invariant: `is_playing` iff `start_time.is_some()`.  Position is never
/// stored; every peer derives it from `start_time` and its own clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportState {
    pub start_time: Option<Timestamp>,
    pub bpm: f64,
    pub is_playing: bool,
}

impl TransportState {
    pub fn stopped(bpm: f64) -> Self {
        Self { start_time: None, bpm, is_playing: false }
    }

    pub fn playing(start_time: Timestamp, bpm: f64) -> Self {
        Self { start_time: Some(start_time), bpm, is_playing: true }
    }

    /// Repair a record that violates the play/start invariant.
    ///
    /// Concurrent edits merged field by field can briefly produce
    /// `is_playing` without a start time (or the reverse); both read as
    /// stopped.
    pub fn normalized(mut self) -> Self {
        if !(self.is_playing && self.start_time.is_some()) {
            self.is_playing = false;
            self.start_time = None;
        }
        if !self.bpm.is_finite() || self.bpm <= 0.0 {
            self.bpm = DEFAULT_BPM;
        }
        self
    }

    /// Elapsed playback seconds at local time `now`, if playing.
    ///
    /// A start time ahead of the local clock yields zero.
    pub fn elapsed_secs(&self, now: Timestamp) -> Option<f64> {
        match (self.is_playing, self.start_time) {
            (true, Some(start)) => Some(elapsed_secs(start, now)),
            _ => None,
        }
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::stopped(DEFAULT_BPM)
    }
}

/// Seconds between `start` and `now`, clamped at zero.
#[inline]
pub fn elapsed_secs(start: Timestamp, now: Timestamp) -> f64 {
    (now.saturating_sub(start) as f64 / 1000.0).max(0.0)
}

// ───────────────────────────────────────────────────────────────────
// Geometry records
// ───────────────────────────────────────────────────────────────────

/// WGS84 position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    /// Great-circle distance in metres (haversine).
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// Kind of drawn zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Circle,
    Rectangle,
    Polygon,
    CircleMarker,
}

/// Geometry payload of a zone, tagged with its kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ZoneGeometry {
    Circle { center: GeoPoint, radius_m: f64 },
    Rectangle { south_west: GeoPoint, north_east: GeoPoint },
    Polygon { ring: Vec<GeoPoint> },
    CircleMarker { center: GeoPoint, radius_m: f64 },
}

impl ZoneGeometry {
    pub fn kind(&self) -> ZoneKind {
        match self {
            ZoneGeometry::Circle { .. } => ZoneKind::Circle,
            ZoneGeometry::Rectangle { .. } => ZoneKind::Rectangle,
            ZoneGeometry::Polygon { .. } => ZoneKind::Polygon,
            ZoneGeometry::CircleMarker { .. } => ZoneKind::CircleMarker,
        }
    }
}

/// A zone as stored in the shared document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRecord {
    pub id: ZoneId,
    pub geometry: ZoneGeometry,
    pub sound_id: Option<String>,
    pub created_by: PeerId,
    pub created_at: Timestamp,
}

impl ZoneRecord {
    pub fn kind(&self) -> ZoneKind {
        self.geometry.kind()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Per-user presence record kept in the document's `users` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub id: PeerId,
    pub name: Option<String>,
    pub connected_at: Timestamp,
    pub last_seen: Timestamp,
    pub hidden_since: Option<Timestamp>,
    pub position: Option<GeoPoint>,
}

impl UserPresence {
    pub fn new(id: PeerId, name: Option<String>, now: Timestamp) -> Self {
        Self {
            id,
            name,
            connected_at: now,
            last_seen: now,
            hidden_since: None,
            position: None,
        }
    }
}
