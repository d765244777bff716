//! # soundscape-collab: peer sessions for Soundscape
//!
//! Ties the shared document, transport sync, zone reconciliation and user
//! presence into one [`PeerSession`] per device, and replicates the
//! document between peers over a relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   SyncEnvelope    ┌─────────────┐   SyncEnvelope    ┌─────────────┐
//! │ PeerSession │ ────────────────► │ LocalRelay  │ ────────────────► │ PeerSession │
//! │ (peer A)    │ ◄──────────────── │ (fan-out)   │ ◄──────────────── │ (peer B)    │
//! └──────┬──────┘                   └─────────────┘                   └──────┬──────┘
//!        ▼                                                                   ▼
//! ┌─────────────┐                                                    ┌─────────────┐
//! │ Yrs Doc     │                                                    │ Yrs Doc     │
//! └─────────────┘                                                    └─────────────┘
//! ```
//!
//! There is no authority: every replica is equal and converges through
//! CRDT merge.
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `SyncEnvelope`
//! - [`relay`]: in-process broadcast medium with lag accounting
//! - [`presence`]: who is here, where, and whether they are visible
//! - [`session`]: per-peer wiring and lifecycle

pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;

pub use presence::{PresenceConfig, PresenceRoom};
pub use protocol::{EnvelopeKind, ProtocolError, SyncEnvelope};
pub use relay::{LocalRelay, RelayStats, DEFAULT_RELAY_CAPACITY};
pub use session::{PeerSession, SessionConfig};
