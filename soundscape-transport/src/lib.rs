//! Master-free transport synchronization.
//!
//! [`TransportSync`] keeps a local playback engine aligned with the
//! session's shared `startTime`.  Drift is corrected by a jittered tokio
//! task started with [`TransportSync::start_corrector`].

pub mod config;
mod corrector;
pub mod engine;
pub mod sync;

pub use config::TransportConfig;
pub use corrector::jittered_delay;
pub use engine::{ClockedEngine, EngineError, EngineState, PlaybackEngine};
pub use sync::{
    DriftCorrection, ListenerId, TransportChange, TransportSync, TransportUpdate, UpdateOrigin,
};
