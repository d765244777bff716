//! One peer of a Soundscape session.
//!
//! [`PeerSession`] is constructed once per peer and passed by reference to
//! everything that needs it.  It owns the replica, the transport clock, the
//! zone reconciler and the presence room, and wires them together:
//!
//! ```text
//!  TransportSync ──(local changes)──► SetPlayback ──┐
//!                                     SetTempo ─────┤
//!  ZoneReconciler ──────────────────► Put/Delete ───┼─► YrsDocument ──► relay
//!  PresenceRoom ────────────────────► UpsertUser ───┘        │
//!        ▲                ▲                ▲                 │ snapshots
//!        └── observe ─────┴─ reconcile ────┴─ sync_from_remote
//! ```
//!
//! Remote-origin transport changes are never written back, so two peers
//! cannot ping-pong the same state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use soundscape_core::{
    lock_unpoisoned, Clock, DocumentOp, DocumentSnapshot, GeoPoint, PeerId, SharedDocument,
    Subscription, UserPresence, YrsDocument,
};
use soundscape_transport::{
    ListenerId, PlaybackEngine, TransportChange, TransportConfig, TransportSync, TransportUpdate,
    UpdateOrigin,
};
use soundscape_zones::{ProximityTracker, SoundingSet, ZoneConfig, ZoneReconciler, ZoneRenderer};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::presence::{PresenceConfig, PresenceRoom};
use crate::protocol::{EnvelopeKind, ProtocolError, SyncEnvelope};
use crate::relay::LocalRelay;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub display_name: Option<String>,
    pub transport: TransportConfig,
    pub zones: ZoneConfig,
    pub presence: PresenceConfig,
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            display_name: None,
            transport: TransportConfig::for_testing(),
            zones: ZoneConfig::for_testing(),
            presence: PresenceConfig::for_testing(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

pub struct PeerSession {
    peer_id: PeerId,
    clock: Arc<dyn Clock>,
    doc: Arc<YrsDocument>,
    transport: Arc<TransportSync>,
    zones: Arc<ZoneReconciler>,
    presence: Arc<Mutex<PresenceRoom>>,
    proximity: Mutex<ProximityTracker>,
    heartbeat_interval: Duration,
    /// Snapshot subscriptions (transport, presence, zones).
    observers: Mutex<Vec<Subscription>>,
    /// Forwarding of local deltas to the relay.
    outbound: Mutex<Option<Subscription>>,
    relay: Mutex<Option<Arc<LocalRelay>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    transport_listener: Mutex<Option<ListenerId>>,
    envelope_clock: AtomicU64,
    shut_down: AtomicBool,
}

impl PeerSession {
    pub fn new(
        mut config: SessionConfig,
        clock: Arc<dyn Clock>,
        renderer: Box<dyn ZoneRenderer>,
    ) -> Arc<Self> {
        config.presence = config.presence.validated();
        let peer_id = PeerId::new();
        let now = clock.now_ms();
        let doc = Arc::new(YrsDocument::new());
        let transport = Arc::new(TransportSync::new(clock.clone(), config.transport.clone()));
        let zones = Arc::new(ZoneReconciler::new(
            peer_id,
            doc.clone(),
            clock.clone(),
            renderer,
            &config.zones,
        ));
        let presence = Arc::new(Mutex::new(PresenceRoom::new(
            peer_id,
            config.display_name.clone(),
            &config.presence,
            now,
        )));

        let session = Arc::new(Self {
            peer_id,
            clock,
            doc,
            transport,
            zones,
            presence,
            proximity: Mutex::new(ProximityTracker::new(&config.zones)),
            heartbeat_interval: config.presence.heartbeat_interval,
            observers: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
            relay: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            transport_listener: Mutex::new(None),
            envelope_clock: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });
        session.wire();
        info!("Peer {peer_id} session created");
        session
    }

    fn wire(&self) {
        let join = lock_unpoisoned(&self.presence).join_op();
        self.publish_ops(vec![join]);

        // Local transport changes go to the document; remote ones stay put.
        let doc = Arc::clone(&self.doc);
        let listener = self.transport.on_change(move |update: &TransportUpdate| {
            if update.origin != UpdateOrigin::Local {
                return;
            }
            // Only the fields this change touched, so concurrent edits of
            // the other fields by another peer survive the merge.
            let state = &update.state;
            let ops = match update.change {
                TransportChange::Playback => vec![DocumentOp::SetPlayback { start_time: state.start_time }],
                TransportChange::Tempo => vec![DocumentOp::SetTempo { bpm: state.bpm }],
                TransportChange::Full => vec![DocumentOp::SetTransport(state.clone())],
            };
            if let Err(e) = doc.mutate(ops) {
                warn!("Publishing transport state failed: {e}");
            }
        });
        *lock_unpoisoned(&self.transport_listener) = Some(listener);

        let transport = Arc::downgrade(&self.transport);
        let presence = Arc::clone(&self.presence);
        let weak_doc: Weak<YrsDocument> = Arc::downgrade(&self.doc);
        let clock = Arc::clone(&self.clock);
        let observer = self.doc.subscribe(Box::new(move |snapshot: &DocumentSnapshot| {
            if let Some(transport) = transport.upgrade() {
                transport.sync_from_remote(&snapshot.transport);
            }
            let reannounce = lock_unpoisoned(&presence).observe(&snapshot.users, clock.now_ms());
            if let (Some(op), Some(doc)) = (reannounce, weak_doc.upgrade()) {
                if let Err(e) = doc.mutate(vec![op]) {
                    warn!("Re-announcing presence failed: {e}");
                }
            }
        }));
        let zones = self.zones.attach();

        let current = self.doc.read();
        self.transport.sync_from_remote(&current.transport);
        lock_unpoisoned(&self.presence).observe(&current.users, self.clock.now_ms());

        lock_unpoisoned(&self.observers).extend([observer, zones]);
    }

    // ───────────────────── accessors ─────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn document(&self) -> &Arc<YrsDocument> {
        &self.doc
    }

    pub fn transport(&self) -> &Arc<TransportSync> {
        &self.transport
    }

    pub fn zones(&self) -> &Arc<ZoneReconciler> {
        &self.zones
    }

    /// The local user's presence record.
    pub fn local_user(&self) -> UserPresence {
        lock_unpoisoned(&self.presence).local().clone()
    }

    /// Other users currently visible.
    pub fn visible_peers(&self) -> Vec<UserPresence> {
        lock_unpoisoned(&self.presence).visible_peers()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // ───────────────────── lifecycle ─────────────────────

    /// Attach the playback engine.  Any transport state already observed is
    /// applied right away.
    pub fn initialize(&self, engine: Box<dyn PlaybackEngine>) {
        self.transport.initialize(engine);
    }

    /// Start the drift corrector and the presence heartbeat on the current
    /// tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self.is_shut_down() {
            warn!("start() after shutdown ignored");
            return;
        }
        self.transport.start_corrector();

        let weak = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if session.is_shut_down() {
                    break;
                }
                session.heartbeat();
            }
        });
        lock_unpoisoned(&self.tasks).push(task);
    }

    /// Join `relay`: forward local deltas, listen for remote ones, and run
    /// the join handshake.
    pub fn connect(self: &Arc<Self>, relay: Arc<LocalRelay>) -> Result<(), ProtocolError> {
        if self.is_shut_down() {
            warn!("connect() after shutdown ignored");
            return Ok(());
        }
        let mut receiver = relay.join(self.peer_id);

        let forward_relay = Arc::clone(&relay);
        let peer_id = self.peer_id;
        let weak = Arc::downgrade(self);
        let outbound = self.doc.on_local_update(move |update: &[u8]| {
            let clock = weak
                .upgrade()
                .map(|session| session.next_clock())
                .unwrap_or_default();
            if let Err(e) = forward_relay.publish(&SyncEnvelope::update(peer_id, clock, update.to_vec())) {
                warn!("Forwarding local update failed: {e}");
            }
        });
        *lock_unpoisoned(&self.outbound) = Some(outbound);

        let weak = Arc::downgrade(self);
        let inbound_relay = Arc::clone(&relay);
        let task = tokio::spawn(async move {
            loop {
                let bytes = match receiver.recv().await {
                    Ok(bytes) => bytes,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Relay receiver lagged by {skipped} envelopes; resyncing");
                        inbound_relay.record_dropped(skipped);
                        match weak.upgrade() {
                            Some(session) => session.request_sync(&inbound_relay),
                            None => break,
                        }
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match SyncEnvelope::decode(&bytes).and_then(|envelope| session.handle_envelope(&envelope)) {
                    Ok(Some(reply)) => {
                        if let Err(e) = inbound_relay.publish(&reply) {
                            warn!("Sending sync reply failed: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping envelope: {e}"),
                }
            }
            debug!("Relay listener stopped");
        });
        lock_unpoisoned(&self.tasks).push(task);

        // Our state may predate the connection; push it, then ask for theirs.
        let full = SyncEnvelope::update(self.peer_id, self.next_clock(), self.doc.encode_full_state());
        relay.publish(&full)?;
        self.request_sync(&relay);
        *lock_unpoisoned(&self.relay) = Some(relay);
        info!("Peer {} connected to relay", self.peer_id);
        Ok(())
    }

    fn request_sync(&self, relay: &LocalRelay) {
        let request = SyncEnvelope::state_vector(self.peer_id, self.next_clock(), self.doc.encode_state_vector());
        if let Err(e) = relay.publish(&request) {
            warn!("Requesting sync failed: {e}");
        }
    }

    /// Apply one envelope from the relay.  Returns a reply to publish, if
    /// any.
    pub fn handle_envelope(&self, envelope: &SyncEnvelope) -> Result<Option<SyncEnvelope>, ProtocolError> {
        if !envelope.is_for(self.peer_id) || self.is_shut_down() {
            return Ok(None);
        }
        match envelope.kind {
            EnvelopeKind::Update | EnvelopeKind::Diff => {
                self.doc.apply_remote_update(&envelope.payload)?;
                Ok(None)
            }
            EnvelopeKind::StateVector => {
                let diff = self.doc.encode_diff(&envelope.payload)?;
                Ok(Some(SyncEnvelope::diff(self.peer_id, envelope.peer_id, self.next_clock(), diff)))
            }
        }
    }

    fn next_clock(&self) -> u64 {
        self.envelope_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ───────────────────── presence & audio ─────────────────────

    /// Record the local listener position, publish it, and return the
    /// sounding set if it changed.
    pub fn update_position(&self, position: GeoPoint) -> Option<SoundingSet> {
        let now = self.clock.now_ms();
        let op = lock_unpoisoned(&self.presence).set_position(position, now);
        self.publish_ops(vec![op]);
        lock_unpoisoned(&self.proximity).update(&self.zones, &position, now)
    }

    /// Recompute the sounding set at the last known position, ignoring the
    /// throttle.
    pub fn refresh_sounding(&self) -> Option<SoundingSet> {
        let position = lock_unpoisoned(&self.presence).position()?;
        lock_unpoisoned(&self.proximity).force(&self.zones, &position, self.clock.now_ms())
    }

    pub fn sounding(&self) -> SoundingSet {
        lock_unpoisoned(&self.proximity).current().clone()
    }

    pub fn set_hidden(&self, hidden: bool) {
        let op = lock_unpoisoned(&self.presence).set_hidden(hidden, self.clock.now_ms());
        if let Some(op) = op {
            self.publish_ops(vec![op]);
        }
    }

    /// Refresh our presence if due and prune peers that went silent.
    pub fn heartbeat(&self) {
        let now = self.clock.now_ms();
        let mut ops = Vec::new();
        {
            let mut presence = lock_unpoisoned(&self.presence);
            ops.extend(presence.heartbeat(now));
            ops.extend(presence.prune(now));
        }
        if !ops.is_empty() {
            self.publish_ops(ops);
        }
    }

    fn publish_ops(&self, ops: Vec<DocumentOp>) {
        if let Err(e) = self.doc.mutate(ops) {
            warn!("Document mutation failed: {e}");
        }
    }

    // ───────────────────── shutdown ─────────────────────

    /// Leave the session.  Idempotent; nothing fires after it returns.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for mut subscription in lock_unpoisoned(&self.observers).drain(..) {
            subscription.unsubscribe();
        }
        if let Some(id) = lock_unpoisoned(&self.transport_listener).take() {
            self.transport.remove_listener(id);
        }

        // Announce departure while local deltas are still forwarded.
        let leave = lock_unpoisoned(&self.presence).leave_op();
        self.publish_ops(vec![leave]);

        if let Some(mut outbound) = lock_unpoisoned(&self.outbound).take() {
            outbound.unsubscribe();
        }
        for task in lock_unpoisoned(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(relay) = lock_unpoisoned(&self.relay).take() {
            relay.leave(&self.peer_id);
        }
        self.transport.teardown();
        info!("Peer {} shut down", self.peer_id);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundscape_core::{ManualClock, TransportState};
    use soundscape_transport::ClockedEngine;
    use soundscape_zones::RecordingRenderer;
    use std::sync::atomic::AtomicUsize;

    fn session(now: i64) -> (Arc<PeerSession>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let session = PeerSession::new(
            SessionConfig::for_testing().with_name("Test"),
            clock.clone(),
            Box::new(RecordingRenderer::new()),
        );
        session.initialize(Box::new(ClockedEngine::new(clock.clone())));
        (session, clock)
    }

    fn remote_update(ops: Vec<DocumentOp>) -> SyncEnvelope {
        let other = YrsDocument::new();
        other.mutate(ops).unwrap();
        SyncEnvelope::update(PeerId::new(), 1, other.encode_full_state())
    }

    #[test]
    fn test_joins_document_on_creation() {
        let (session, _) = session(1_000);
        let users = session.document().read().users;
        assert_eq!(users.len(), 1);
        assert_eq!(users[&session.peer_id()].name.as_deref(), Some("Test"));
        assert_eq!(session.local_user().connected_at, 1_000);
    }

    #[test]
    fn test_local_play_is_published() {
        let (session, _) = session(2_000);
        session.transport().play();
        let transport = session.document().read().transport;
        assert!(transport.is_playing);
        assert_eq!(transport.start_time, Some(2_000));
    }

    #[test]
    fn test_remote_transport_is_not_republished() {
        let (session, clock) = session(1_500);
        let published = Arc::new(AtomicUsize::new(0));
        let counter = published.clone();
        let _sub = session.document().on_local_update(move |_: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let envelope = remote_update(vec![DocumentOp::SetTransport(TransportState::playing(1_000, 100.0))]);
        session.handle_envelope(&envelope).unwrap();

        let state = session.transport().state();
        assert!(state.is_playing);
        assert_eq!(state.start_time, Some(1_000));
        assert_eq!(state.bpm, 100.0);
        assert_eq!(session.transport().engine_position(), Some(0.5));
        assert_eq!(published.load(Ordering::SeqCst), 0);

        clock.advance(250);
        assert_eq!(session.transport().expected_position(), Some(0.75));
    }

    #[test]
    fn test_state_vector_answered_with_addressed_diff() {
        let (session, _) = session(0);
        let requester = PeerId::new();
        let request = SyncEnvelope::state_vector(requester, 1, YrsDocument::new().encode_state_vector());

        let reply = session.handle_envelope(&request).unwrap().expect("diff reply");
        assert_eq!(reply.kind, EnvelopeKind::Diff);
        assert_eq!(reply.target, Some(requester));
        assert_eq!(reply.peer_id, session.peer_id());

        let fresh = YrsDocument::new();
        fresh.apply_remote_update(&reply.payload).unwrap();
        assert!(fresh.read().users.contains_key(&session.peer_id()));
    }

    #[test]
    fn test_envelopes_for_others_are_ignored() {
        let (session, _) = session(0);
        let version = session.document().version();
        let mut envelope = remote_update(vec![DocumentOp::ClearZones]);
        envelope.target = Some(PeerId::new());
        assert!(session.handle_envelope(&envelope).unwrap().is_none());
        assert_eq!(session.document().version(), version);

        let own = SyncEnvelope::update(session.peer_id(), 1, Vec::new());
        assert!(session.handle_envelope(&own).unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let (session, _) = session(0);
        let envelope = SyncEnvelope::update(PeerId::new(), 1, vec![0xFF, 0x00, 0x13]);
        assert!(matches!(session.handle_envelope(&envelope), Err(ProtocolError::Document(_))));
    }

    #[test]
    fn test_reannounces_after_being_pruned() {
        let (session, _) = session(0);
        let id = session.peer_id();
        session.document().mutate(vec![DocumentOp::RemoveUser { id }]).unwrap();
        assert!(session.document().read().users.contains_key(&id));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (session, _) = session(0);
        session.shutdown();
        session.shutdown();
        assert!(session.is_shut_down());
        assert!(session.document().read().users.is_empty());
        assert!(!session.transport().is_initialized());
        assert_eq!(session.document().subscriber_count(), 0);

        let remote = remote_update(vec![DocumentOp::SetTransport(TransportState::playing(0, 120.0))]);
        assert!(session.handle_envelope(&remote).unwrap().is_none());
        assert!(!session.document().read().transport.is_playing);
    }

    fn exchange(a: &PeerSession, b: &PeerSession) {
        let from_a = SyncEnvelope::update(a.peer_id(), 1, a.document().encode_full_state());
        let from_b = SyncEnvelope::update(b.peer_id(), 1, b.document().encode_full_state());
        a.handle_envelope(&from_b).unwrap();
        b.handle_envelope(&from_a).unwrap();
    }

    #[test]
    fn test_concurrent_pause_and_tempo_both_survive() {
        let (a, _) = session(1_000);
        let (b, _) = session(1_000);
        a.transport().play();
        exchange(&a, &b);
        assert!(b.transport().state().is_playing);

        a.transport().pause();
        b.transport().set_tempo(140.0);
        exchange(&a, &b);

        for peer in [&a, &b] {
            assert_eq!(peer.document().read().transport, TransportState::stopped(140.0));
            assert_eq!(peer.transport().state(), TransportState::stopped(140.0));
        }
        assert_eq!(b.transport().engine_position(), Some(0.0));
    }

    #[test]
    fn test_stale_tempo_change_does_not_restart_playback() {
        let (a, _) = session(1_000);
        let (b, _) = session(1_000);
        a.transport().play();
        exchange(&a, &b);

        // B has not seen A's pause when it changes the tempo.
        a.transport().pause();
        let pause = SyncEnvelope::update(a.peer_id(), 2, a.document().encode_full_state());
        b.transport().set_tempo(90.0);
        b.handle_envelope(&pause).unwrap();

        let transport = b.document().read().transport;
        assert!(!transport.is_playing);
        assert_eq!(transport.start_time, None);
        assert_eq!(transport.bpm, 90.0);
    }

    #[test]
    fn test_refresh_sounding_picks_up_sound_assignment() {
        let (session, _) = session(0);
        let center = GeoPoint::new(51.5, -0.12);
        let zone = session
            .zones()
            .create_zone(soundscape_core::ZoneGeometry::Circle { center, radius_m: 20.0 }, None)
            .unwrap();
        assert!(session.refresh_sounding().is_none());

        assert!(session.update_position(center).is_none());
        session.zones().assign_sound(&zone, Some("wind".into())).unwrap();
        let sounding = session.refresh_sounding().expect("sound now bound");
        assert_eq!(sounding.volume_of(&zone), Some(1.0));
        assert!(session.refresh_sounding().is_none());
        assert_eq!(session.sounding(), sounding);
    }
}
