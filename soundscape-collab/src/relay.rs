//! In-process fan-out relay between peers.
//!
//! Uses a tokio broadcast channel: one send reaches every joined peer.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! envelopes; a peer that falls further behind sees `Lagged` and resyncs
//! with a state-vector handshake.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use soundscape_core::{lock_unpoisoned, PeerId};
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SyncEnvelope};

pub const DEFAULT_RELAY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicRelayStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Shared medium all peers of one session publish to.
pub struct LocalRelay {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: Mutex<HashSet<PeerId>>,
    stats: AtomicRelayStats,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}

impl LocalRelay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Mutex::new(HashSet::new()),
            stats: AtomicRelayStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a peer and hand it a receiver.
    pub fn join(&self, peer: PeerId) -> broadcast::Receiver<Arc<Vec<u8>>> {
        lock_unpoisoned(&self.peers).insert(peer);
        self.sender.subscribe()
    }

    pub fn leave(&self, peer: &PeerId) -> bool {
        lock_unpoisoned(&self.peers).remove(peer)
    }

    /// Encode and send to every receiver.  Returns the receiver count.
    pub fn publish(&self, envelope: &SyncEnvelope) -> Result<usize, ProtocolError> {
        Ok(self.publish_raw(Arc::new(envelope.encode()?)))
    }

    /// Send pre-encoded bytes.
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for envelopes a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        lock_unpoisoned(&self.peers).contains(peer)
    }

    pub fn peer_count(&self) -> usize {
        lock_unpoisoned(&self.peers).len()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_receivers() {
        let relay = LocalRelay::new(16);
        let (a, b) = (PeerId::new(), PeerId::new());
        let mut rx_a = relay.join(a);
        let mut rx_b = relay.join(b);
        assert_eq!(relay.peer_count(), 2);

        let envelope = SyncEnvelope::update(a, 1, vec![7, 7]);
        assert_eq!(relay.publish(&envelope).unwrap(), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let bytes = rx.recv().await.unwrap();
            assert_eq!(SyncEnvelope::decode(&bytes).unwrap(), envelope);
        }
        assert_eq!(relay.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let relay = LocalRelay::default();
        assert_eq!(relay.publish_raw(Arc::new(vec![1])), 0);
        assert_eq!(relay.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let relay = LocalRelay::new(2);
        let peer = PeerId::new();
        let mut rx = relay.join(peer);
        for i in 0..5u8 {
            relay.publish_raw(Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => relay.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(relay.stats().messages_dropped, 3);
    }

    #[test]
    fn test_leave() {
        let relay = LocalRelay::default();
        let peer = PeerId::new();
        let _rx = relay.join(peer);
        assert!(relay.has_peer(&peer));
        assert!(relay.leave(&peer));
        assert!(!relay.leave(&peer));
        assert_eq!(relay.stats().active_peers, 0);
    }
}
