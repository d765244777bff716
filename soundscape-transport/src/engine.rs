//! Playback engine seam.
//!
//! The audio scheduler itself lives outside this workspace; the transport
//! only needs tempo, start/stop and a seekable position in seconds.

use std::sync::Arc;
use thiserror::Error;

use soundscape_core::{Clock, Timestamp};

/// Errors reported by a playback engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("engine failed to start: {0}")]
    Start(String),
    #[error("engine failed to stop: {0}")]
    Stop(String),
    #[error("engine failed to seek: {0}")]
    Seek(String),
    #[error("engine rejected tempo: {0}")]
    Tempo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Started,
    Stopped,
}

/// Scheduling/audio engine driven by the transport.
pub trait PlaybackEngine: Send {
    fn set_tempo(&mut self, bpm: f64) -> Result<(), EngineError>;
    fn start(&mut self) -> Result<(), EngineError>;
    fn stop(&mut self) -> Result<(), EngineError>;
    /// Current playback position in seconds.
    fn position_secs(&self) -> f64;
    fn set_position_secs(&mut self, secs: f64) -> Result<(), EngineError>;
    fn state(&self) -> EngineState;
}

/// Software engine whose position advances with a wall clock.
///
/// `rate` scales how fast the position runs relative to the clock; a
/// value other than `1.0` models an audio device whose sample clock
/// drifts from the system clock.
pub struct ClockedEngine {
    clock: Arc<dyn Clock>,
    rate: f64,
    bpm: f64,
    /// Position at the moment of the last start/seek.
    anchor_secs: f64,
    /// Wall time of the last start/seek while running.
    anchor_at: Option<Timestamp>,
}

impl ClockedEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_rate(clock, 1.0)
    }

    pub fn with_rate(clock: Arc<dyn Clock>, rate: f64) -> Self {
        Self {
            clock,
            rate,
            bpm: soundscape_core::DEFAULT_BPM,
            anchor_secs: 0.0,
            anchor_at: None,
        }
    }

    pub fn tempo(&self) -> f64 {
        self.bpm
    }
}

impl PlaybackEngine for ClockedEngine {
    fn set_tempo(&mut self, bpm: f64) -> Result<(), EngineError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(EngineError::Tempo(format!("{bpm}")));
        }
        self.bpm = bpm;
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.anchor_at.is_none() {
            self.anchor_at = Some(self.clock.now_ms());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.anchor_secs = self.position_secs();
        self.anchor_at = None;
        Ok(())
    }

    fn position_secs(&self) -> f64 {
        match self.anchor_at {
            Some(at) => {
                let wall = (self.clock.now_ms() - at) as f64 / 1000.0;
                self.anchor_secs + wall.max(0.0) * self.rate
            }
            None => self.anchor_secs,
        }
    }

    fn set_position_secs(&mut self, secs: f64) -> Result<(), EngineError> {
        if !secs.is_finite() {
            return Err(EngineError::Seek(format!("{secs}")));
        }
        self.anchor_secs = secs.max(0.0);
        if self.anchor_at.is_some() {
            self.anchor_at = Some(self.clock.now_ms());
        }
        Ok(())
    }

    fn state(&self) -> EngineState {
        if self.anchor_at.is_some() {
            EngineState::Started
        } else {
            EngineState::Stopped
        }
    }
}
