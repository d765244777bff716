//! Replicated session document.
//!
//! [`SharedDocument`] is the seam both subsystems talk to: `read` a
//! snapshot, `mutate` with a batch of [`DocumentOp`]s, `subscribe` to
//! change notifications.  [`YrsDocument`] implements it on a yrs `Doc`
//! with three root maps:
//!
//! ```text
//! transport ── startTime : number | null
//!           ├─ bpm       : number
//!           └─ isPlaying : bool
//! shapes    ── <zone id> : ZoneRecord (JSON)
//! users     ── <peer id> : UserPresence (JSON)
//! ```
//!
//! Transport fields are stored individually so concurrent edits to
//! different fields merge; same-field conflicts follow yrs map semantics.
//!
//! Notifications are delivered after every internal lock is released, so
//! callbacks may read or mutate the document again.  A mutation issued
//! from inside a callback is not delivered recursively: the delivering
//! thread loops and hands out a fresh snapshot once the current round is
//! done, which keeps every subscriber's view monotonic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::{lock_unpoisoned, PeerId, Timestamp, TransportState, UserPresence, ZoneId, ZoneRecord};

const MAP_TRANSPORT: &str = "transport";
const MAP_SHAPES: &str = "shapes";
const MAP_USERS: &str = "users";

const KEY_START_TIME: &str = "startTime";
const KEY_BPM: &str = "bpm";
const KEY_IS_PLAYING: &str = "isPlaying";

/// Errors raised by the document layer.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to apply remote update: {0}")]
    Apply(String),
}

/// Immutable view of the document at one version.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentSnapshot {
    pub transport: TransportState,
    pub shapes: BTreeMap<ZoneId, ZoneRecord>,
    pub users: BTreeMap<PeerId, UserPresence>,
    /// Local commit counter; increases with every local or remote change.
    pub version: u64,
}

/// Document mutations.  Each one is idempotent; a batch commits as one
/// transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DocumentOp {
    /// Write all three transport fields.
    SetTransport(TransportState),
    /// Write `startTime` and `isPlaying` only; `None` means stopped.
    SetPlayback { start_time: Option<Timestamp> },
    /// Write `bpm` only.
    SetTempo { bpm: f64 },
    PutZone(ZoneRecord),
    SetZoneSound { id: ZoneId, sound_id: Option<String> },
    DeleteZone { id: ZoneId },
    ClearZones,
    UpsertUser(UserPresence),
    RemoveUser { id: PeerId },
}

/// Callback receiving a snapshot after each change.
pub type ChangeCallback = Box<dyn Fn(&DocumentSnapshot) + Send + Sync>;

/// Contract of the replicated store as consumed by the core.
pub trait SharedDocument: Send + Sync {
    /// Current state.
    fn read(&self) -> DocumentSnapshot;

    /// Apply `ops` atomically.  Returns the encoded delta for replication.
    fn mutate(&self, ops: Vec<DocumentOp>) -> Result<Vec<u8>, DocumentError>;

    /// Register a change callback.  It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    fn subscribe(&self, on_change: ChangeCallback) -> Subscription;

    /// Version of the most recent commit.
    fn version(&self) -> u64;
}

/// Handle that removes a registered callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// Remove the callback.  Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.is_active()).finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Callback registry
// ───────────────────────────────────────────────────────────────────

struct Registry<C: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<C>)>,
}

impl<C: ?Sized> Registry<C> {
    fn new() -> Self {
        Self { next_id: 0, entries: Vec::new() }
    }

    fn add(&mut self, callback: Arc<C>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry, _)| *entry != id);
    }

    fn callbacks(&self) -> Vec<Arc<C>> {
        self.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }
}

type SnapshotFn = dyn Fn(&DocumentSnapshot) + Send + Sync;
type UpdateFn = dyn Fn(&[u8]) + Send + Sync;

fn registry_subscription<C: ?Sized + Send + Sync + 'static>(
    registry: &Arc<Mutex<Registry<C>>>,
    id: u64,
) -> Subscription {
    let weak: Weak<Mutex<Registry<C>>> = Arc::downgrade(registry);
    Subscription::new(move || {
        if let Some(registry) = weak.upgrade() {
            lock_unpoisoned(&registry).remove(id);
        }
    })
}

#[derive(Default)]
struct DeliveryState {
    delivering: bool,
    dirty: bool,
}

// ───────────────────────────────────────────────────────────────────
// YrsDocument
// ───────────────────────────────────────────────────────────────────

/// In-process replica of the session document backed by yrs.
pub struct YrsDocument {
    doc: Doc,
    transport: MapRef,
    shapes: MapRef,
    users: MapRef,
    /// Serializes yrs transactions; never held while callbacks run.
    txn_gate: Mutex<()>,
    version: AtomicU64,
    subscribers: Arc<Mutex<Registry<SnapshotFn>>>,
    update_listeners: Arc<Mutex<Registry<UpdateFn>>>,
    delivery: Mutex<DeliveryState>,
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsDocument")
            .field("client_id", &self.doc.client_id())
            .field("version", &self.version())
            .finish()
    }
}

impl YrsDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let transport = doc.get_or_insert_map(MAP_TRANSPORT);
        let shapes = doc.get_or_insert_map(MAP_SHAPES);
        let users = doc.get_or_insert_map(MAP_USERS);
        Self {
            doc,
            transport,
            shapes,
            users,
            txn_gate: Mutex::new(()),
            version: AtomicU64::new(0),
            subscribers: Arc::new(Mutex::new(Registry::new())),
            update_listeners: Arc::new(Mutex::new(Registry::new())),
            delivery: Mutex::new(DeliveryState::default()),
        }
    }

    /// Register a listener for deltas produced by *local* mutations.
    ///
    /// Remote updates applied through [`apply_remote_update`] are not
    /// reported, so forwarding these deltas never echoes a peer's own edit
    /// back to it.
    ///
    /// [`apply_remote_update`]: YrsDocument::apply_remote_update
    pub fn on_local_update(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> Subscription {
        let id = lock_unpoisoned(&self.update_listeners).add(Arc::new(listener));
        registry_subscription(&self.update_listeners, id)
    }

    /// Merge a delta produced by another replica.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
        {
            let _gate = lock_unpoisoned(&self.txn_gate);
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocumentError::Apply(format!("{e:?}")))?;
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        self.deliver();
        Ok(())
    }

    /// Encoded state vector, sent to a peer to request what we are missing.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let _gate = lock_unpoisoned(&self.txn_gate);
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_state_vector`
    /// lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        let _gate = lock_unpoisoned(&self.txn_gate);
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Full document state as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let _gate = lock_unpoisoned(&self.txn_gate);
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Number of registered change callbacks.
    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.subscribers).entries.len()
    }

    // ───────────────────── delivery ─────────────────────

    fn deliver(&self) {
        {
            let mut state = lock_unpoisoned(&self.delivery);
            if state.delivering {
                state.dirty = true;
                return;
            }
            state.delivering = true;
        }

        loop {
            let snapshot = self.read();
            let callbacks = lock_unpoisoned(&self.subscribers).callbacks();
            for callback in callbacks {
                callback(&snapshot);
            }

            let mut state = lock_unpoisoned(&self.delivery);
            if state.dirty {
                state.dirty = false;
                continue;
            }
            state.delivering = false;
            break;
        }
    }

    // ───────────────────── reads ─────────────────────

    fn read_transport<T: ReadTxn>(&self, txn: &T) -> TransportState {
        let defaults = TransportState::default();
        let start_time = match self.transport.get(txn, KEY_START_TIME) {
            Some(Out::Any(Any::Number(n))) if n.is_finite() => Some(n as Timestamp),
            Some(Out::Any(Any::BigInt(n))) => Some(n),
            _ => None,
        };
        let bpm = match self.transport.get(txn, KEY_BPM) {
            Some(Out::Any(Any::Number(n))) => n,
            Some(Out::Any(Any::BigInt(n))) => n as f64,
            _ => defaults.bpm,
        };
        let is_playing = matches!(
            self.transport.get(txn, KEY_IS_PLAYING),
            Some(Out::Any(Any::Bool(true)))
        );
        TransportState { start_time, bpm, is_playing }.normalized()
    }

    fn read_records<T, R>(map: &MapRef, txn: &T, what: &str) -> Vec<R>
    where
        T: ReadTxn,
        R: for<'de> Deserialize<'de>,
    {
        let mut records = Vec::new();
        for (key, value) in map.iter(txn) {
            match value {
                Out::Any(Any::String(json)) => match serde_json::from_str::<R>(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => log::warn!("Skipping malformed {what} record {key}: {e}"),
                },
                _ => log::warn!("Skipping non-JSON {what} entry {key}"),
            }
        }
        records
    }

    // ───────────────────── writes ─────────────────────

    fn write_transport(&self, txn: &mut TransactionMut, state: &TransportState) {
        let state = state.clone().normalized();
        self.write_playback(txn, state.start_time);
        self.write_tempo(txn, state.bpm);
    }

    fn write_playback(&self, txn: &mut TransactionMut, start_time: Option<Timestamp>) {
        let start = match start_time {
            Some(t) => Any::Number(t as f64),
            None => Any::Null,
        };
        self.transport.insert(txn, KEY_START_TIME, start);
        self.transport.insert(txn, KEY_IS_PLAYING, Any::Bool(start_time.is_some()));
    }

    fn write_tempo(&self, txn: &mut TransactionMut, bpm: f64) {
        if !(bpm.is_finite() && bpm > 0.0) {
            log::warn!("Ignoring invalid tempo {bpm}");
            return;
        }
        self.transport.insert(txn, KEY_BPM, Any::Number(bpm));
    }

    fn write_sound(&self, txn: &mut TransactionMut, id: &ZoneId, sound_id: &Option<String>) {
        let existing = match self.shapes.get(&*txn, id.as_str()) {
            Some(Out::Any(Any::String(json))) => serde_json::from_str::<ZoneRecord>(&json).ok(),
            _ => None,
        };
        let Some(mut record) = existing else {
            log::debug!("Sound assignment for unknown zone {id} ignored");
            return;
        };
        record.sound_id = sound_id.clone();
        match serde_json::to_string(&record) {
            Ok(json) => {
                self.shapes.insert(txn, id.to_string(), json);
            }
            Err(e) => log::warn!("Failed to re-encode zone {id}: {e}"),
        }
    }

    fn apply_op(&self, txn: &mut TransactionMut, op: &DocumentOp, payload: Option<String>) {
        match (op, payload) {
            (DocumentOp::SetTransport(state), _) => self.write_transport(txn, state),
            (DocumentOp::SetPlayback { start_time }, _) => self.write_playback(txn, *start_time),
            (DocumentOp::SetTempo { bpm }, _) => self.write_tempo(txn, *bpm),
            (DocumentOp::PutZone(record), Some(json)) => {
                self.shapes.insert(txn, record.id.to_string(), json);
            }
            (DocumentOp::SetZoneSound { id, sound_id }, _) => self.write_sound(txn, id, sound_id),
            (DocumentOp::DeleteZone { id }, _) => {
                self.shapes.remove(txn, id.as_str());
            }
            (DocumentOp::ClearZones, _) => self.shapes.clear(txn),
            (DocumentOp::UpsertUser(user), Some(json)) => {
                self.users.insert(txn, user.id.to_string(), json);
            }
            (DocumentOp::RemoveUser { id }, _) => {
                self.users.remove(txn, &id.to_string());
            }
            (DocumentOp::PutZone(_), None) | (DocumentOp::UpsertUser(_), None) => {}
        }
    }
}

/// Serialize record payloads up front so a batch either fully encodes or
/// never opens a transaction.
fn encode_payload(op: &DocumentOp) -> Result<Option<String>, DocumentError> {
    Ok(match op {
        DocumentOp::PutZone(record) => Some(serde_json::to_string(record)?),
        DocumentOp::UpsertUser(user) => Some(serde_json::to_string(user)?),
        _ => None,
    })
}

impl SharedDocument for YrsDocument {
    fn read(&self) -> DocumentSnapshot {
        let _gate = lock_unpoisoned(&self.txn_gate);
        let txn = self.doc.transact();
        let shapes = Self::read_records::<_, ZoneRecord>(&self.shapes, &txn, "zone")
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        let users = Self::read_records::<_, UserPresence>(&self.users, &txn, "user")
            .into_iter()
            .map(|user| (user.id, user))
            .collect();
        DocumentSnapshot {
            transport: self.read_transport(&txn),
            shapes,
            users,
            version: self.version.load(Ordering::SeqCst),
        }
    }

    fn mutate(&self, ops: Vec<DocumentOp>) -> Result<Vec<u8>, DocumentError> {
        let payloads = ops.iter().map(encode_payload).collect::<Result<Vec<_>, _>>()?;

        let update = {
            let _gate = lock_unpoisoned(&self.txn_gate);
            let mut txn = self.doc.transact_mut();
            for (op, payload) in ops.iter().zip(payloads) {
                self.apply_op(&mut txn, op, payload);
            }
            let update = txn.encode_update_v1();
            self.version.fetch_add(1, Ordering::SeqCst);
            update
        };

        let listeners = lock_unpoisoned(&self.update_listeners).callbacks();
        for listener in listeners {
            listener(&update);
        }
        self.deliver();
        Ok(update)
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        let callback: Arc<SnapshotFn> = Arc::from(on_change);
        let id = lock_unpoisoned(&self.subscribers).add(callback);
        registry_subscription(&self.subscribers, id)
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeoPoint, ZoneGeometry};
    use std::sync::atomic::AtomicUsize;

    fn zone(id: &str) -> ZoneRecord {
        ZoneRecord {
            id: ZoneId::from(id),
            geometry: ZoneGeometry::Circle { center: GeoPoint::new(48.1, 11.5), radius_m: 25.0 },
            sound_id: None,
            created_by: PeerId::new(),
            created_at: 1,
        }
    }

    #[test]
    fn test_empty_document_defaults() {
        let doc = YrsDocument::new();
        let snapshot = doc.read();
        assert_eq!(snapshot.transport, TransportState::default());
        assert!(snapshot.shapes.is_empty());
        assert!(snapshot.users.is_empty());
        assert_eq!(snapshot.version, 0);
    }

    #[test]
    fn test_transport_roundtrip_through_maps() {
        let doc = YrsDocument::new();
        doc.mutate(vec![DocumentOp::SetTransport(TransportState::playing(1_000, 128.0))])
            .unwrap();
        assert_eq!(doc.read().transport, TransportState::playing(1_000, 128.0));

        doc.mutate(vec![DocumentOp::SetTransport(TransportState::stopped(128.0))])
            .unwrap();
        let transport = doc.read().transport;
        assert_eq!(transport.start_time, None);
        assert!(!transport.is_playing);
    }

    #[test]
    fn test_zone_put_sound_delete() {
        let doc = YrsDocument::new();
        doc.mutate(vec![DocumentOp::PutZone(zone("a")), DocumentOp::PutZone(zone("b"))])
            .unwrap();
        assert_eq!(doc.read().shapes.len(), 2);

        doc.mutate(vec![DocumentOp::SetZoneSound {
            id: ZoneId::from("a"),
            sound_id: Some("bells".into()),
        }])
        .unwrap();
        let snapshot = doc.read();
        assert_eq!(snapshot.shapes[&ZoneId::from("a")].sound_id.as_deref(), Some("bells"));

        doc.mutate(vec![DocumentOp::DeleteZone { id: ZoneId::from("a") }]).unwrap();
        let snapshot = doc.read();
        assert!(!snapshot.shapes.contains_key(&ZoneId::from("a")));
        assert!(snapshot.shapes.contains_key(&ZoneId::from("b")));
    }

    #[test]
    fn test_sound_for_missing_zone_is_noop() {
        let doc = YrsDocument::new();
        doc.mutate(vec![DocumentOp::SetZoneSound {
            id: ZoneId::from("ghost"),
            sound_id: Some("x".into()),
        }])
        .unwrap();
        assert!(doc.read().shapes.is_empty());
    }

    #[test]
    fn test_clear_zones() {
        let doc = YrsDocument::new();
        doc.mutate(vec![DocumentOp::PutZone(zone("a")), DocumentOp::PutZone(zone("b"))])
            .unwrap();
        doc.mutate(vec![DocumentOp::ClearZones]).unwrap();
        assert!(doc.read().shapes.is_empty());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let doc = YrsDocument::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut sub = doc.subscribe(Box::new(move |_: &DocumentSnapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        doc.mutate(vec![DocumentOp::PutZone(zone("a"))]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe(); // idempotent
        doc.mutate(vec![DocumentOp::PutZone(zone("b"))]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(doc.subscriber_count(), 0);
    }

    #[test]
    fn test_nested_mutation_delivers_in_order() {
        let doc = Arc::new(YrsDocument::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        // First subscriber reacts to zone "a" by writing zone "b".
        let weak = Arc::downgrade(&doc);
        let _writer = doc.subscribe(Box::new(move |snapshot: &DocumentSnapshot| {
            if snapshot.shapes.contains_key(&ZoneId::from("a"))
                && !snapshot.shapes.contains_key(&ZoneId::from("b"))
            {
                if let Some(doc) = weak.upgrade() {
                    doc.mutate(vec![DocumentOp::PutZone(zone("b"))]).unwrap();
                }
            }
        }));
        let log = seen.clone();
        let _reader = doc.subscribe(Box::new(move |snapshot: &DocumentSnapshot| {
            lock_unpoisoned(&log).push(snapshot.version);
        }));

        doc.mutate(vec![DocumentOp::PutZone(zone("a"))]).unwrap();

        let versions = lock_unpoisoned(&seen).clone();
        assert_eq!(versions.len(), 2);
        assert!(versions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(doc.read().shapes.len(), 2);
    }

    #[test]
    fn test_remote_update_convergence() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();

        let delta = a.mutate(vec![DocumentOp::PutZone(zone("a"))]).unwrap();
        b.apply_remote_update(&delta).unwrap();
        assert!(b.read().shapes.contains_key(&ZoneId::from("a")));

        let delta = b
            .mutate(vec![DocumentOp::SetTransport(TransportState::playing(5_000, 100.0))])
            .unwrap();
        a.apply_remote_update(&delta).unwrap();
        assert_eq!(a.read().transport, b.read().transport);
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        a.mutate(vec![DocumentOp::PutZone(zone("a"))]).unwrap();
        a.mutate(vec![DocumentOp::PutZone(zone("b"))]).unwrap();

        let diff = a.encode_diff(&b.encode_state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert_eq!(b.read().shapes.len(), 2);

        let c = YrsDocument::new();
        c.apply_remote_update(&a.encode_full_state()).unwrap();
        assert_eq!(c.read().shapes, a.read().shapes);
    }

    #[test]
    fn test_local_update_listener_skips_remote() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = forwarded.clone();
        let _sub = b.on_local_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let delta = a.mutate(vec![DocumentOp::PutZone(zone("a"))]).unwrap();
        b.apply_remote_update(&delta).unwrap();
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);

        b.mutate(vec![DocumentOp::ClearZones]).unwrap();
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_garbage_update_rejected() {
        let doc = YrsDocument::new();
        let err = doc.apply_remote_update(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, DocumentError::Decode(_) | DocumentError::Apply(_)));
    }

    #[test]
    fn test_concurrent_delete_and_put_converge() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        let base = a.mutate(vec![DocumentOp::PutZone(zone("x"))]).unwrap();
        b.apply_remote_update(&base).unwrap();

        let from_a = a.mutate(vec![DocumentOp::DeleteZone { id: ZoneId::from("x") }]).unwrap();
        let from_b = b.mutate(vec![DocumentOp::PutZone(zone("y"))]).unwrap();
        a.apply_remote_update(&from_b).unwrap();
        b.apply_remote_update(&from_a).unwrap();

        assert_eq!(a.read().shapes, b.read().shapes);
        assert_eq!(a.read().shapes.len(), 1);
    }

    #[test]
    fn test_partial_transport_writes() {
        let doc = YrsDocument::new();
        doc.mutate(vec![DocumentOp::SetTransport(TransportState::playing(1_000, 120.0))])
            .unwrap();

        doc.mutate(vec![DocumentOp::SetTempo { bpm: 140.0 }]).unwrap();
        assert_eq!(doc.read().transport, TransportState::playing(1_000, 140.0));

        doc.mutate(vec![DocumentOp::SetPlayback { start_time: None }]).unwrap();
        assert_eq!(doc.read().transport, TransportState::stopped(140.0));

        doc.mutate(vec![DocumentOp::SetTempo { bpm: f64::NAN }]).unwrap();
        assert_eq!(doc.read().transport.bpm, 140.0);
    }

    #[test]
    fn test_concurrent_pause_and_tempo_merge() {
        // Fresh replicas each round so client ids (and thus tie-breaks) vary.
        for _ in 0..20 {
            let a = YrsDocument::new();
            let b = YrsDocument::new();
            let base = a
                .mutate(vec![DocumentOp::SetTransport(TransportState::playing(1_000, 120.0))])
                .unwrap();
            b.apply_remote_update(&base).unwrap();

            let pause = a.mutate(vec![DocumentOp::SetPlayback { start_time: None }]).unwrap();
            let tempo = b.mutate(vec![DocumentOp::SetTempo { bpm: 140.0 }]).unwrap();
            a.apply_remote_update(&tempo).unwrap();
            b.apply_remote_update(&pause).unwrap();

            assert_eq!(a.read().transport, TransportState::stopped(140.0));
            assert_eq!(b.read().transport, TransportState::stopped(140.0));
        }
    }
}
