//! Binary envelope for replicating the session document between peers.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────┬──────────┬──────────────┬─────────┬──────────┐
//! │ kind │ peer_id  │ target       │ clock   │ payload  │
//! │ u8   │ 16 bytes │ 0 | 16 bytes │ varint  │ variable │
//! └──────┴──────────┴──────────────┴─────────┴──────────┘
//! ```
//!
//! Joining is a two-step handshake on top of plain update broadcast: the
//! newcomer publishes its full state as an `Update` and its state vector;
//! every other peer answers with a `Diff` addressed to the newcomer.

use serde::{Deserialize, Serialize};
use soundscape_core::{DocumentError, PeerId};
use thiserror::Error;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Incremental yrs update produced by a local mutation.
    Update = 1,
    /// yrs state vector; receivers answer with a `Diff`.
    StateVector = 2,
    /// yrs update answering a `StateVector`.
    Diff = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub kind: EnvelopeKind,
    pub peer_id: PeerId,
    /// Addressee; `None` means every peer.
    pub target: Option<PeerId>,
    /// Sender-local counter, for ordering diagnostics.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncEnvelope {
    pub fn update(peer_id: PeerId, clock: u64, update: Vec<u8>) -> Self {
        Self { kind: EnvelopeKind::Update, peer_id, target: None, clock, payload: update }
    }

    pub fn state_vector(peer_id: PeerId, clock: u64, state_vector: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::StateVector,
            peer_id,
            target: None,
            clock,
            payload: state_vector,
        }
    }

    pub fn diff(peer_id: PeerId, target: PeerId, clock: u64, diff: Vec<u8>) -> Self {
        Self { kind: EnvelopeKind::Diff, peer_id, target: Some(target), clock, payload: diff }
    }

    /// Whether `peer` should process this envelope.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.peer_id != peer && self.target.is_none_or(|target| target == peer)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
}
