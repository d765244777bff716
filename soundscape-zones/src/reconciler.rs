//! Local-first zone reconciliation.
//!
//! Each peer keeps a purely local shadow of the shared zone map: one
//! collision shape and one render handle per zone.  The shadow is updated
//! from two directions:
//!
//! ```text
//!   local draw ──► mint id ──► render + shadow ──► pending ──► PutZone
//!                                                     │
//!   document snapshot ──► reconcile ──────────────────┘ confirm / create / remove
//! ```
//!
//! * An id in the *pending* set was created here and has not yet been seen
//!   in a snapshot.  The deletion path never removes it, whatever a
//!   snapshot read at that instant says.
//! * An id in the *processed* set has a shadow entry (or was found
//!   unusable) and is never drawn again.
//! * After a local delete or clear, snapshots older than the resulting
//!   commit are skipped so a stale read cannot resurrect what was removed.
//!
//! Sound bindings are never cached locally; they are always read from the
//! shared document.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use soundscape_core::{
    lock_unpoisoned, Clock, DocumentOp, DocumentSnapshot, GeoPoint, PeerId, SharedDocument,
    Subscription, ZoneGeometry, ZoneId, ZoneRecord,
};

use crate::config::ZoneConfig;
use crate::error::ZoneError;
use crate::geometry::{degree_extents, GeometryAdapter, PlanarGeometry};
use crate::proximity::{ZoneHit, ZoneProximity};
use crate::renderer::{RenderHandle, ZoneRenderer};
use crate::spatial::{Aabb, SpatialHash};

/// A zone to create during an import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDraft {
    pub geometry: ZoneGeometry,
    #[serde(default)]
    pub sound_id: Option<String>,
}

/// What one reconciliation pass changed locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Zones from other peers drawn for the first time.
    pub created: Vec<ZoneId>,
    /// Local creations seen coming back through the document.
    pub confirmed: Vec<ZoneId>,
    /// Zones deleted elsewhere and erased here.
    pub removed: Vec<ZoneId>,
    /// The snapshot predates a local delete/clear and was ignored.
    pub stale: bool,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.confirmed.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Local shadow
// ───────────────────────────────────────────────────────────────────

struct ShadowState<S> {
    renderer: Box<dyn ZoneRenderer>,
    shapes: FxHashMap<ZoneId, S>,
    index: SpatialHash<ZoneId>,
    handle_by_zone: FxHashMap<ZoneId, RenderHandle>,
    zone_by_handle: FxHashMap<RenderHandle, ZoneId>,
    processed: FxHashSet<ZoneId>,
    pending: FxHashSet<ZoneId>,
    /// Snapshots with a lower version are stale.
    min_version: u64,
}

impl<S> ShadowState<S> {
    fn install(&mut self, id: &ZoneId, geometry: &ZoneGeometry, shape: S, bounds: Aabb) {
        let handle = self.renderer.draw(id, geometry);
        self.handle_by_zone.insert(id.clone(), handle);
        self.zone_by_handle.insert(handle, id.clone());
        self.index.insert(id.clone(), bounds);
        self.shapes.insert(id.clone(), shape);
        self.processed.insert(id.clone());
    }

    /// Drop every trace of `id`.  Returns whether anything was known.
    fn forget(&mut self, id: &ZoneId) -> bool {
        let handle = self.handle_by_zone.remove(id);
        if let Some(handle) = handle {
            self.renderer.erase(handle);
            self.zone_by_handle.remove(&handle);
        }
        self.index.remove(id);
        let had_shape = self.shapes.remove(id).is_some();
        let was_processed = self.processed.remove(id);
        let was_pending = self.pending.remove(id);
        handle.is_some() || had_shape || was_processed || was_pending
    }

    fn reset(&mut self) {
        self.renderer.clear();
        self.shapes.clear();
        self.index.clear();
        self.handle_by_zone.clear();
        self.zone_by_handle.clear();
        self.processed.clear();
        self.pending.clear();
    }

    fn skip_through(&mut self, version: u64) {
        self.min_version = self.min_version.max(version.saturating_add(1));
    }
}

// ───────────────────────────────────────────────────────────────────
// ZoneReconciler
// ───────────────────────────────────────────────────────────────────

/// Keeps this peer's drawn zones consistent with the shared zone map.
///
/// One instance per peer, shared by `Arc`.  Renderer calls happen under the
/// internal lock, so a renderer must not call back into the reconciler.
pub struct ZoneReconciler<G: GeometryAdapter = PlanarGeometry> {
    peer: PeerId,
    doc: Arc<dyn SharedDocument>,
    clock: Arc<dyn Clock>,
    geometry: G,
    state: Mutex<ShadowState<G::Shape>>,
}

impl ZoneReconciler<PlanarGeometry> {
    pub fn new(
        peer: PeerId,
        doc: Arc<dyn SharedDocument>,
        clock: Arc<dyn Clock>,
        renderer: Box<dyn ZoneRenderer>,
        config: &ZoneConfig,
    ) -> Self {
        Self::with_geometry(peer, doc, clock, renderer, config, PlanarGeometry)
    }
}

impl<G: GeometryAdapter> ZoneReconciler<G> {
    pub fn with_geometry(
        peer: PeerId,
        doc: Arc<dyn SharedDocument>,
        clock: Arc<dyn Clock>,
        renderer: Box<dyn ZoneRenderer>,
        config: &ZoneConfig,
        geometry: G,
    ) -> Self {
        let config = config.clone().validated();
        Self {
            peer,
            doc,
            clock,
            geometry,
            state: Mutex::new(ShadowState {
                renderer,
                shapes: FxHashMap::default(),
                index: SpatialHash::new(config.cell_size_deg),
                handle_by_zone: FxHashMap::default(),
                zone_by_handle: FxHashMap::default(),
                processed: FxHashSet::default(),
                pending: FxHashSet::default(),
                min_version: 0,
            }),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    // ───────────────────── local mutations ─────────────────────

    /// Draw a zone locally and publish it.
    ///
    /// The zone is rendered and queryable before this returns; the id stays
    /// pending until a snapshot containing it is reconciled.
    pub fn create_zone(
        &self,
        geometry: ZoneGeometry,
        sound_id: Option<String>,
    ) -> Result<ZoneId, ZoneError> {
        let shape = self.geometry.build_shape(&geometry)?;
        let bounds = self.geometry.bounds(&shape);
        let now = self.clock.now_ms();
        let id = ZoneId::mint(now);

        {
            let mut state = lock_unpoisoned(&self.state);
            state.install(&id, &geometry, shape, bounds);
            state.pending.insert(id.clone());
        }

        let record = ZoneRecord {
            id: id.clone(),
            geometry,
            sound_id,
            created_by: self.peer,
            created_at: now,
        };
        if let Err(e) = self.doc.mutate(vec![DocumentOp::PutZone(record)]) {
            warn!("Publishing zone {id} failed, rolling back: {e}");
            lock_unpoisoned(&self.state).forget(&id);
            return Err(e.into());
        }
        debug!("Created zone {id}");
        Ok(id)
    }

    /// Delete a zone everywhere.  Local state is cleaned up immediately.
    ///
    /// Returns `Ok(false)` when the id is unknown both locally and in the
    /// document.
    pub fn delete_zone(&self, id: &ZoneId) -> Result<bool, ZoneError> {
        let known_locally = lock_unpoisoned(&self.state).forget(id);
        if !known_locally && !self.doc.read().shapes.contains_key(id) {
            debug!("Delete of unknown zone {id} ignored");
            return Ok(false);
        }

        lock_unpoisoned(&self.state).skip_through(self.doc.version());
        self.doc.mutate(vec![DocumentOp::DeleteZone { id: id.clone() }])?;
        debug!("Deleted zone {id}");
        Ok(true)
    }

    /// Delete the zone drawn under `handle`.
    pub fn delete_by_handle(&self, handle: RenderHandle) -> Result<bool, ZoneError> {
        let id = lock_unpoisoned(&self.state).zone_by_handle.get(&handle).cloned();
        match id {
            Some(id) => self.delete_zone(&id),
            None => Ok(false),
        }
    }

    /// Erase everything locally and publish one bulk clear.
    pub fn clear_all(&self) -> Result<(), ZoneError> {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.reset();
            state.skip_through(self.doc.version());
        }
        self.doc.mutate(vec![DocumentOp::ClearZones])?;
        info!("Cleared all zones");
        Ok(())
    }

    /// Replace every zone with `drafts`: a clear followed by one local
    /// creation per draft.  All drafts are validated first, so an invalid
    /// one leaves the current zones untouched.
    pub fn import_zones(&self, drafts: Vec<ZoneDraft>) -> Result<Vec<ZoneId>, ZoneError> {
        for draft in &drafts {
            self.geometry.build_shape(&draft.geometry)?;
        }
        self.clear_all()?;
        let ids = drafts
            .into_iter()
            .map(|draft| self.create_zone(draft.geometry, draft.sound_id))
            .collect::<Result<Vec<_>, _>>()?;
        info!("Imported {} zones", ids.len());
        Ok(ids)
    }

    /// Bind (or unbind) a sound.  Goes through the document only.
    pub fn assign_sound(&self, id: &ZoneId, sound_id: Option<String>) -> Result<bool, ZoneError> {
        if !self.doc.read().shapes.contains_key(id) {
            debug!("Sound assignment for unknown zone {id} ignored");
            return Ok(false);
        }
        self.doc.mutate(vec![DocumentOp::SetZoneSound { id: id.clone(), sound_id }])?;
        Ok(true)
    }

    /// Sound bound to `id` in the shared document.
    pub fn sound_for_zone(&self, id: &ZoneId) -> Option<String> {
        self.doc.read().shapes.get(id).and_then(|record| record.sound_id.clone())
    }

    // ───────────────────── remote observation ─────────────────────

    /// Bring the local shadow in line with `snapshot`.  Idempotent.
    pub fn reconcile(&self, snapshot: &DocumentSnapshot) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut state = lock_unpoisoned(&self.state);

        if snapshot.version < state.min_version {
            debug!(
                "Skipping stale snapshot v{} (need v{})",
                snapshot.version, state.min_version
            );
            report.stale = true;
            return report;
        }
        state.min_version = snapshot.version;

        for (id, record) in &snapshot.shapes {
            if state.pending.remove(id) {
                state.processed.insert(id.clone());
                report.confirmed.push(id.clone());
                continue;
            }
            if state.processed.contains(id) {
                continue;
            }
            match self.geometry.build_shape(&record.geometry) {
                Ok(shape) => {
                    let bounds = self.geometry.bounds(&shape);
                    state.install(id, &record.geometry, shape, bounds);
                    debug!("Drew remote zone {id} from {}", record.created_by);
                    report.created.push(id.clone());
                }
                Err(e) => {
                    warn!("Ignoring zone {id}: {e}");
                    state.processed.insert(id.clone());
                }
            }
        }

        let gone: Vec<ZoneId> = state
            .processed
            .iter()
            .filter(|id| !snapshot.shapes.contains_key(*id) && !state.pending.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            state.forget(&id);
            debug!("Erased zone {id} deleted remotely");
            report.removed.push(id);
        }
        report.removed.sort();
        report
    }

    // ───────────────────── queries ─────────────────────

    pub fn zone_count(&self) -> usize {
        lock_unpoisoned(&self.state).shapes.len()
    }

    /// Ids with a local shadow entry, sorted.
    pub fn zone_ids(&self) -> Vec<ZoneId> {
        let mut ids: Vec<ZoneId> = lock_unpoisoned(&self.state).shapes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &ZoneId) -> bool {
        lock_unpoisoned(&self.state).shapes.contains_key(id)
    }

    pub fn is_pending(&self, id: &ZoneId) -> bool {
        lock_unpoisoned(&self.state).pending.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.state).pending.len()
    }

    pub fn handle_for(&self, id: &ZoneId) -> Option<RenderHandle> {
        lock_unpoisoned(&self.state).handle_by_zone.get(id).copied()
    }

    pub fn zone_for_handle(&self, handle: RenderHandle) -> Option<ZoneId> {
        lock_unpoisoned(&self.state).zone_by_handle.get(&handle).cloned()
    }

    /// Zones whose area contains `point`, sorted by id.
    pub fn hit_test(&self, point: &GeoPoint) -> Vec<ZoneId> {
        if !point.is_finite() {
            return Vec::new();
        }
        let state = lock_unpoisoned(&self.state);
        let mut hits: Vec<ZoneId> = state
            .index
            .hit_test_all(point.lng, point.lat)
            .into_iter()
            .filter(|id| {
                state
                    .shapes
                    .get(id)
                    .is_some_and(|shape| self.geometry.contains(shape, point))
            })
            .collect();
        hits.sort();
        hits
    }

    /// Colliding zones plus non-containing zones within `threshold_m`.
    pub fn proximity(&self, position: &GeoPoint, threshold_m: f64) -> ZoneProximity {
        let mut result = ZoneProximity::default();
        if !position.is_finite() {
            return result;
        }
        let threshold_m = if threshold_m.is_finite() { threshold_m.max(0.0) } else { 0.0 };
        let records = self.doc.read().shapes;

        let state = lock_unpoisoned(&self.state);
        let (dlng, dlat) = degree_extents(position, threshold_m);
        let region = Aabb::around(position.lng, position.lat, dlng, dlat);
        for id in state.index.query_region(&region) {
            let Some(shape) = state.shapes.get(&id) else {
                continue;
            };
            let sound_id = records.get(&id).and_then(|record| record.sound_id.clone());
            if self.geometry.contains(shape, position) {
                result.colliding.push(ZoneHit { id, sound_id, distance_m: 0.0, volume: 1.0 });
                continue;
            }
            if threshold_m <= 0.0 {
                continue;
            }
            let distance_m = self.geometry.distance_m(shape, position);
            if distance_m <= threshold_m {
                let volume = (1.0 - distance_m / threshold_m).max(0.0);
                result.nearby.push(ZoneHit { id, sound_id, distance_m, volume });
            }
        }
        result.colliding.sort_by(|a, b| a.id.cmp(&b.id));
        result
            .nearby
            .sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m).then_with(|| a.id.cmp(&b.id)));
        result
    }
}

impl<G> ZoneReconciler<G>
where
    G: GeometryAdapter + 'static,
    G::Shape: 'static,
{
    /// Reconcile against the current document, then on every change.
    ///
    /// The subscription holds only a weak reference; dropping the last
    /// `Arc` of the reconciler makes the callback a no-op.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let weak = Arc::downgrade(self);
        let subscription = self.doc.subscribe(Box::new(move |snapshot: &DocumentSnapshot| {
            if let Some(zones) = weak.upgrade() {
                zones.reconcile(snapshot);
            }
        }));
        self.reconcile(&self.doc.read());
        subscription
    }
}
