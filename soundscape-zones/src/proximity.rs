//! Collision and proximity against the reconciled zone set.
//!
//! [`ZoneReconciler::proximity`] answers one query.  [`ProximityTracker`]
//! sits in front of it for the audio layer: it throttles recomputation and
//! only reports a [`SoundingSet`] when what should be audible changed.

use soundscape_core::{GeoPoint, Timestamp, ZoneId};

use crate::config::ZoneConfig;
use crate::geometry::GeometryAdapter;
use crate::reconciler::ZoneReconciler;

/// Volume changes below this are not reported.
pub const VOLUME_EPSILON: f64 = 0.01;

/// One zone relative to the listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneHit {
    pub id: ZoneId,
    /// Sound bound to the zone in the shared document.
    pub sound_id: Option<String>,
    /// Distance to the zone edge in metres; `0.0` when inside.
    pub distance_m: f64,
    /// `max(0, 1 - distance / threshold)`; `1.0` when inside.
    pub volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneProximity {
    /// Zones containing the position, ordered by id.
    pub colliding: Vec<ZoneHit>,
    /// Non-containing zones within the threshold, nearest first.
    pub nearby: Vec<ZoneHit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoundingZone {
    pub id: ZoneId,
    pub sound_id: String,
    pub volume: f64,
    pub inside: bool,
}

/// Zones that should currently be audible, ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoundingSet {
    pub zones: Vec<SoundingZone>,
}

impl SoundingSet {
    /// Every colliding or nearby zone that has a sound bound.
    pub fn from_proximity(proximity: &ZoneProximity) -> Self {
        let inside = proximity.colliding.iter().map(|hit| (hit, true));
        let near = proximity.nearby.iter().map(|hit| (hit, false));
        let mut zones: Vec<SoundingZone> = inside
            .chain(near)
            .filter_map(|(hit, inside)| {
                hit.sound_id.as_ref().map(|sound_id| SoundingZone {
                    id: hit.id.clone(),
                    sound_id: sound_id.clone(),
                    volume: hit.volume,
                    inside,
                })
            })
            .collect();
        zones.sort_by(|a, b| a.id.cmp(&b.id));
        Self { zones }
    }

    pub fn ids(&self) -> Vec<&ZoneId> {
        self.zones.iter().map(|z| &z.id).collect()
    }

    pub fn volume_of(&self, id: &ZoneId) -> Option<f64> {
        self.zones.iter().find(|z| &z.id == id).map(|z| z.volume)
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Whether switching from `self` to `other` needs an audio update.
    fn differs_from(&self, other: &SoundingSet) -> bool {
        self.zones.len() != other.zones.len()
            || self.zones.iter().zip(&other.zones).any(|(a, b)| {
                a.id != b.id
                    || a.sound_id != b.sound_id
                    || a.inside != b.inside
                    || (a.volume - b.volume).abs() > VOLUME_EPSILON
            })
    }
}

/// Throttled, change-only proximity updates.
#[derive(Debug, Clone)]
pub struct ProximityTracker {
    threshold_m: f64,
    interval_ms: i64,
    last_run: Option<Timestamp>,
    current: SoundingSet,
}

impl ProximityTracker {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            threshold_m: config.proximity_threshold_m,
            interval_ms: i64::try_from(config.recompute_interval.as_millis()).unwrap_or(i64::MAX),
            last_run: None,
            current: SoundingSet::default(),
        }
    }

    /// Recompute if the throttle interval has passed.  Returns the new set
    /// only when it differs from the last reported one.
    pub fn update<G: GeometryAdapter>(
        &mut self,
        zones: &ZoneReconciler<G>,
        position: &GeoPoint,
        now: Timestamp,
    ) -> Option<SoundingSet> {
        if let Some(last) = self.last_run {
            if now.saturating_sub(last) < self.interval_ms {
                return None;
            }
        }
        self.force(zones, position, now)
    }

    /// Recompute regardless of the throttle.
    pub fn force<G: GeometryAdapter>(
        &mut self,
        zones: &ZoneReconciler<G>,
        position: &GeoPoint,
        now: Timestamp,
    ) -> Option<SoundingSet> {
        self.last_run = Some(now);
        let next = SoundingSet::from_proximity(&zones.proximity(position, self.threshold_m));
        if !next.differs_from(&self.current) {
            return None;
        }
        self.current = next.clone();
        Some(next)
    }

    /// Last reported set.
    pub fn current(&self) -> &SoundingSet {
        &self.current
    }

    /// Forget the last report; the next update always recomputes.
    pub fn reset(&mut self) {
        self.last_run = None;
        self.current = SoundingSet::default();
    }
}
