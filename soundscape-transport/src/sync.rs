//! Timestamp-based transport synchronization.
//!
//! Every peer derives its playback position from the shared `startTime`
//! and its own wall clock: `position = (now - startTime) / 1000`.  There is
//! no master; after the first `play()` nobody is a source of truth except
//! the timestamp itself.
//!
//! ```text
//!            play() / remote playing
//!   Stopped ─────────────────────────► Playing ──┐ set_tempo()
//!      ▲                                  │  ◄───┘ (no reseek)
//!      └──────────────────────────────────┘
//!            pause() / remote stopped
//! ```
//!
//! Position is measured in elapsed seconds, never in beats, by both the
//! initiator and the drift corrector.  Tempo changes therefore never move
//! the expected position.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use soundscape_core::{lock_unpoisoned, Clock, TransportState};

use crate::config::TransportConfig;
use crate::corrector::{spawn_corrector, CorrectorHandle};
use crate::engine::{EngineError, EngineState, PlaybackEngine};

pub type ListenerId = u64;

/// Where a state change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A local `play`/`pause`/`set_tempo` call; should be published.
    Local,
    /// Applied from the shared document; must not be published again.
    Remote,
}

/// Which shared fields a change touched.  Publishers write only those, so
/// a tempo change and a concurrent play/pause from another peer both
/// survive the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChange {
    /// `startTime` and `isPlaying`.
    Playback,
    /// `bpm` only.
    Tempo,
    /// Playback and tempo together (remote states only).
    Full,
}

impl TransportChange {
    fn between(before: &TransportState, after: &TransportState) -> Self {
        let playback = before.start_time != after.start_time || before.is_playing != after.is_playing;
        match (playback, before.bpm != after.bpm) {
            (true, true) => TransportChange::Full,
            (true, false) => TransportChange::Playback,
            (false, _) => TransportChange::Tempo,
        }
    }
}

/// A state change delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportUpdate {
    pub state: TransportState,
    pub origin: UpdateOrigin,
    pub change: TransportChange,
}

/// Result of a drift check that moved the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftCorrection {
    pub expected_secs: f64,
    pub actual_secs: f64,
    pub drift_secs: f64,
    /// The engine was found stopped while the transport is playing and was
    /// started again.
    pub restarted: bool,
}

type Listener = Arc<dyn Fn(&TransportUpdate) + Send + Sync>;

fn log_engine(op: &str, result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!("Playback engine {op} failed: {e}");
    }
}

// ───────────────────────────────────────────────────────────────────
// Core state (guarded)
// ───────────────────────────────────────────────────────────────────

pub(crate) struct TransportCore {
    config: TransportConfig,
    clock: Arc<dyn Clock>,
    engine: Option<Box<dyn PlaybackEngine>>,
    state: TransportState,
    initialized: bool,
    /// Nesting depth of remote applications currently being dispatched.
    remote_depth: u32,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: ListenerId,
}

impl TransportCore {
    fn new(clock: Arc<dyn Clock>, config: TransportConfig) -> Self {
        let state = TransportState::stopped(config.default_bpm);
        Self {
            config,
            clock,
            engine: None,
            state,
            initialized: false,
            remote_depth: 0,
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    fn local(&self, change: TransportChange) -> Option<TransportUpdate> {
        Some(TransportUpdate { state: self.state.clone(), origin: UpdateOrigin::Local, change })
    }

    fn initialize(&mut self, engine: Box<dyn PlaybackEngine>) {
        if self.initialized {
            info!("Transport re-initialised with a new playback engine");
        }
        self.engine = Some(engine);
        self.initialized = true;
        let target = self.state.clone();
        self.apply_to_engine(&target, true);
    }

    fn play(&mut self) -> Option<TransportUpdate> {
        if !self.initialized {
            warn!("play() called before transport initialisation; ignoring");
            return None;
        }
        if self.state.is_playing {
            debug!("play() while already playing; keeping start time");
            return None;
        }

        let now = self.clock.now_ms();
        self.state = TransportState::playing(now, self.state.bpm);
        if let Some(engine) = self.engine.as_deref_mut() {
            log_engine("tempo", engine.set_tempo(self.state.bpm));
            log_engine("seek", engine.set_position_secs(0.0));
            if engine.state() != EngineState::Started {
                log_engine("start", engine.start());
            }
        }
        info!("Transport started at {now} ({} bpm)", self.state.bpm);
        self.local(TransportChange::Playback)
    }

    fn pause(&mut self) -> Option<TransportUpdate> {
        if !self.initialized {
            warn!("pause() called before transport initialisation; ignoring");
            return None;
        }
        let was_playing = self.state.is_playing;
        self.state = TransportState::stopped(self.state.bpm);
        if let Some(engine) = self.engine.as_deref_mut() {
            if engine.state() == EngineState::Started {
                log_engine("stop", engine.stop());
            }
        }
        if !was_playing {
            return None;
        }
        info!("Transport paused");
        self.local(TransportChange::Playback)
    }

    fn set_tempo(&mut self, requested: f64) -> Option<TransportUpdate> {
        if !self.initialized {
            warn!("set_tempo() called before transport initialisation; ignoring");
            return None;
        }
        let Some(bpm) = self.config.clamp_bpm(requested) else {
            warn!("Rejecting non-finite tempo {requested}");
            return None;
        };
        if bpm != requested {
            warn!(
                "Tempo {requested} outside [{}, {}]; clamped to {bpm}",
                self.config.min_bpm, self.config.max_bpm
            );
        }
        if let Some(engine) = self.engine.as_deref_mut() {
            log_engine("tempo", engine.set_tempo(bpm));
        }
        if bpm == self.state.bpm {
            return None;
        }
        self.state.bpm = bpm;
        self.local(TransportChange::Tempo)
    }

    fn sync_from_remote(&mut self, remote: &TransportState) -> Option<TransportUpdate> {
        let mut remote = remote.clone().normalized();
        if let Some(bpm) = self.config.clamp_bpm(remote.bpm) {
            remote.bpm = bpm;
        }

        if !self.initialized {
            debug!("Remote transport state recorded before initialisation");
            self.state = remote;
            return None;
        }

        // An echo of our own run (same start time) must not reseek.
        let same_run = self.state.is_playing
            && remote.is_playing
            && self.state.start_time == remote.start_time;
        self.apply_to_engine(&remote, !same_run);

        if self.state == remote {
            return None;
        }
        debug!("Applied remote transport state {remote:?}");
        let change = TransportChange::between(&self.state, &remote);
        self.state = remote;
        Some(TransportUpdate { state: self.state.clone(), origin: UpdateOrigin::Remote, change })
    }

    /// Drive the engine towards `target`.  `seek` forces a reposition even
    /// when the engine is already running.
    fn apply_to_engine(&mut self, target: &TransportState, seek: bool) {
        let now = self.clock.now_ms();
        let Some(engine) = self.engine.as_deref_mut() else {
            return;
        };
        log_engine("tempo", engine.set_tempo(target.bpm));
        match target.elapsed_secs(now) {
            Some(elapsed) => {
                let running = engine.state() == EngineState::Started;
                if seek || !running {
                    log_engine("seek", engine.set_position_secs(elapsed));
                }
                if !running {
                    log_engine("start", engine.start());
                }
            }
            None => {
                if engine.state() == EngineState::Started {
                    log_engine("stop", engine.stop());
                }
            }
        }
    }

    pub(crate) fn correct_drift(&mut self) -> Option<DriftCorrection> {
        if !self.initialized {
            return None;
        }
        let expected = self.state.elapsed_secs(self.clock.now_ms())?;
        let threshold = self.config.drift_threshold_secs;
        let engine = self.engine.as_deref_mut()?;

        let actual = engine.position_secs();
        let drift = actual - expected;

        if engine.state() != EngineState::Started {
            log_engine("seek", engine.set_position_secs(expected));
            log_engine("start", engine.start());
            debug!("Engine was stopped while playing; restarted at {expected:.3}s");
            return Some(DriftCorrection {
                expected_secs: expected,
                actual_secs: actual,
                drift_secs: drift,
                restarted: true,
            });
        }

        if drift.abs() <= threshold {
            return None;
        }
        log_engine("seek", engine.set_position_secs(expected));
        debug!("Drift {:+.1}ms corrected (engine {actual:.3}s, expected {expected:.3}s)", drift * 1000.0);
        Some(DriftCorrection {
            expected_secs: expected,
            actual_secs: actual,
            drift_secs: drift,
            restarted: false,
        })
    }

    fn teardown(&mut self) {
        self.listeners.clear();
        self.initialized = false;
        self.remote_depth = 0;
    }
}

// ───────────────────────────────────────────────────────────────────
// TransportSync
// ───────────────────────────────────────────────────────────────────

/// One peer's transport clock.
///
/// Construct once per peer and share it by reference (`Arc`).  All methods
/// take `&self`; listeners are always invoked after the internal lock is
/// released, so they may call back into the transport.
pub struct TransportSync {
    core: Arc<Mutex<TransportCore>>,
    corrector: Mutex<Option<CorrectorHandle>>,
}

impl TransportSync {
    pub fn new(clock: Arc<dyn Clock>, config: TransportConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(TransportCore::new(clock, config.validated()))),
            corrector: Mutex::new(None),
        }
    }

    /// Attach the playback engine.  A remote state observed earlier is
    /// applied immediately, so a late joiner starts at the right position.
    pub fn initialize(&self, engine: Box<dyn PlaybackEngine>) {
        lock_unpoisoned(&self.core).initialize(engine);
    }

    pub fn is_initialized(&self) -> bool {
        lock_unpoisoned(&self.core).initialized
    }

    /// Last known state.
    pub fn state(&self) -> TransportState {
        lock_unpoisoned(&self.core).state.clone()
    }

    /// Start playback now.  Idempotent: while playing, the existing
    /// `startTime` is kept and returned unchanged.
    pub fn play(&self) -> TransportState {
        self.local_op(TransportCore::play)
    }

    /// Stop playback and clear `startTime`.
    pub fn pause(&self) -> TransportState {
        self.local_op(TransportCore::pause)
    }

    /// Change tempo without touching `startTime`.  Non-finite values are
    /// rejected; finite ones are clamped into the configured range.
    pub fn set_tempo(&self, bpm: f64) -> TransportState {
        self.local_op(|core| core.set_tempo(bpm))
    }

    /// Apply a transport state observed in the shared document.
    ///
    /// Tolerates echoes of local changes: a state with the same start time
    /// as the current run only updates tempo.
    pub fn sync_from_remote(&self, state: &TransportState) {
        let update = {
            let mut core = lock_unpoisoned(&self.core);
            let update = core.sync_from_remote(state);
            if update.is_some() {
                core.remote_depth += 1;
            }
            update
        };
        if let Some(update) = update {
            self.dispatch(&update);
            let mut core = lock_unpoisoned(&self.core);
            core.remote_depth = core.remote_depth.saturating_sub(1);
        }
    }

    /// Whether a remote state is currently being applied.  Publishers
    /// check this to avoid echoing remote state back to the document.
    pub fn is_applying_remote_update(&self) -> bool {
        lock_unpoisoned(&self.core).remote_depth > 0
    }

    /// One drift check: snap the engine to the expected position if it is
    /// off by more than the threshold.
    pub fn correct_drift(&self) -> Option<DriftCorrection> {
        lock_unpoisoned(&self.core).correct_drift()
    }

    /// Position the engine should be at right now, if playing.
    pub fn expected_position(&self) -> Option<f64> {
        let core = lock_unpoisoned(&self.core);
        core.state.elapsed_secs(core.clock.now_ms())
    }

    /// Position the engine reports, if one is attached.
    pub fn engine_position(&self) -> Option<f64> {
        lock_unpoisoned(&self.core).engine.as_ref().map(|e| e.position_secs())
    }

    pub fn on_change(&self, listener: impl Fn(&TransportUpdate) + Send + Sync + 'static) -> ListenerId {
        let mut core = lock_unpoisoned(&self.core);
        let id = core.next_listener_id;
        core.next_listener_id += 1;
        core.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut core = lock_unpoisoned(&self.core);
        let before = core.listeners.len();
        core.listeners.retain(|(entry, _)| *entry != id);
        core.listeners.len() != before
    }

    /// Spawn the periodic drift corrector on the current tokio runtime.
    ///
    /// Returns `false` if it is already running or no runtime is available.
    pub fn start_corrector(&self) -> bool {
        let mut slot = lock_unpoisoned(&self.corrector);
        if slot.as_ref().is_some_and(|handle| !handle.is_cancelled()) {
            return false;
        }
        let (interval, jitter) = {
            let core = lock_unpoisoned(&self.core);
            (core.config.corrector_interval, core.config.jitter_ratio)
        };
        match spawn_corrector(Arc::clone(&self.core), interval, jitter) {
            Some(handle) => {
                *slot = Some(handle);
                true
            }
            None => false,
        }
    }

    pub fn is_corrector_running(&self) -> bool {
        lock_unpoisoned(&self.corrector)
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }

    /// Cancel the corrector, drop listeners and mark uninitialised.
    /// Safe to call any number of times.
    pub fn teardown(&self) {
        if let Some(handle) = lock_unpoisoned(&self.corrector).take() {
            handle.cancel();
            debug!("Drift corrector cancelled");
        }
        lock_unpoisoned(&self.core).teardown();
    }

    fn local_op(&self, op: impl FnOnce(&mut TransportCore) -> Option<TransportUpdate>) -> TransportState {
        let (state, update) = {
            let mut core = lock_unpoisoned(&self.core);
            let update = op(&mut core);
            (core.state.clone(), update)
        };
        if let Some(update) = update {
            self.dispatch(&update);
        }
        state
    }

    fn dispatch(&self, update: &TransportUpdate) {
        let listeners: Vec<Listener> = lock_unpoisoned(&self.core)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(update);
        }
    }
}

impl Drop for TransportSync {
    fn drop(&mut self) {
        if let Some(handle) = lock_unpoisoned(&self.corrector).take() {
            handle.cancel();
        }
    }
}
