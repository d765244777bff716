//! User presence: who is in the session, where they are, whether they are
//! visible.
//!
//! ```text
//! local move / heartbeat / hide
//!       │
//!       ▼
//! PresenceRoom ──► DocumentOp::UpsertUser ──► shared `users` map
//!       ▲                                          │
//!       └──────────── observe(snapshot.users) ◄────┘
//! ```
//!
//! Heartbeats are rate-limited to `heartbeat_interval`.  A peer whose
//! `last_seen` is older than `stale_after` is pruned by whoever notices.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use soundscape_core::{DocumentOp, GeoPoint, PeerId, Timestamp, UserPresence};

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            stale_after: Duration::from_millis(300),
        }
    }

    /// Non-zero heartbeat, and a stale timeout that outlasts several
    /// missed heartbeats.
    pub fn validated(mut self) -> Self {
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = Duration::from_millis(1);
        }
        if self.stale_after <= self.heartbeat_interval {
            self.stale_after = self.heartbeat_interval * 3;
        }
        self
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Presence of the local user plus the last observed state of everyone else.
pub struct PresenceRoom {
    local: UserPresence,
    peers: HashMap<PeerId, UserPresence>,
    heartbeat_ms: i64,
    stale_ms: i64,
    last_heartbeat: Timestamp,
}

impl PresenceRoom {
    pub fn new(local_id: PeerId, name: Option<String>, config: &PresenceConfig, now: Timestamp) -> Self {
        let config = config.clone().validated();
        Self {
            local: UserPresence::new(local_id, name, now),
            peers: HashMap::new(),
            heartbeat_ms: millis(config.heartbeat_interval),
            stale_ms: millis(config.stale_after),
            last_heartbeat: now,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local.id
    }

    pub fn local(&self) -> &UserPresence {
        &self.local
    }

    pub fn position(&self) -> Option<GeoPoint> {
        self.local.position
    }

    /// Op announcing the local user.
    pub fn join_op(&self) -> DocumentOp {
        DocumentOp::UpsertUser(self.local.clone())
    }

    pub fn leave_op(&self) -> DocumentOp {
        DocumentOp::RemoveUser { id: self.local.id }
    }

    fn touch(&mut self, now: Timestamp) -> DocumentOp {
        self.local.last_seen = self.local.last_seen.max(now);
        self.last_heartbeat = now;
        self.join_op()
    }

    pub fn set_position(&mut self, position: GeoPoint, now: Timestamp) -> DocumentOp {
        self.local.position = Some(position);
        self.touch(now)
    }

    /// Hide or show the local user.  `None` when nothing changed.
    pub fn set_hidden(&mut self, hidden: bool, now: Timestamp) -> Option<DocumentOp> {
        match (hidden, self.local.hidden_since) {
            (true, None) => self.local.hidden_since = Some(now),
            (false, Some(_)) => self.local.hidden_since = None,
            _ => return None,
        }
        Some(self.touch(now))
    }

    pub fn is_hidden(&self) -> bool {
        self.local.hidden_since.is_some()
    }

    /// Refresh `last_seen` if a heartbeat is due.
    pub fn heartbeat(&mut self, now: Timestamp) -> Option<DocumentOp> {
        if now.saturating_sub(self.last_heartbeat) < self.heartbeat_ms {
            return None;
        }
        Some(self.touch(now))
    }

    /// Adopt the `users` map from a snapshot.  Returns an op re-announcing
    /// the local user when the snapshot no longer carries it (another peer
    /// pruned us, or a replica is catching up).
    pub fn observe(&mut self, users: &BTreeMap<PeerId, UserPresence>, now: Timestamp) -> Option<DocumentOp> {
        self.peers = users
            .iter()
            .filter(|(id, _)| **id != self.local.id)
            .map(|(id, user)| (*id, user.clone()))
            .collect();
        if users.contains_key(&self.local.id) {
            return None;
        }
        Some(self.touch(now))
    }

    /// Forget peers not seen for `stale_after`; returns their removal ops.
    pub fn prune(&mut self, now: Timestamp) -> Vec<DocumentOp> {
        let stale_ms = self.stale_ms;
        let mut stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|user| now.saturating_sub(user.last_seen) > stale_ms)
            .map(|user| user.id)
            .collect();
        stale.sort();
        for id in &stale {
            self.peers.remove(id);
        }
        stale.into_iter().map(|id| DocumentOp::RemoveUser { id }).collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&UserPresence> {
        self.peers.get(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote users that are not hidden, sorted by id.
    pub fn visible_peers(&self) -> Vec<UserPresence> {
        let mut visible: Vec<UserPresence> = self
            .peers
            .values()
            .filter(|user| user.hidden_since.is_none())
            .cloned()
            .collect();
        visible.sort_by_key(|user| user.id);
        visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(now: Timestamp) -> PresenceRoom {
        PresenceRoom::new(PeerId::new(), Some("Alice".into()), &PresenceConfig::default(), now)
    }

    fn remote(last_seen: Timestamp) -> UserPresence {
        let mut user = UserPresence::new(PeerId::new(), None, 0);
        user.last_seen = last_seen;
        user
    }

    #[test]
    fn test_config_validated() {
        assert_eq!(PresenceConfig::default().validated(), PresenceConfig::default());
        let config = PresenceConfig { heartbeat_interval: Duration::ZERO, stale_after: Duration::ZERO }.validated();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1));
        assert_eq!(config.stale_after, Duration::from_millis(3));

        let config = PresenceConfig {
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(2),
        }
        .validated();
        assert_eq!(config.stale_after, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_stale_after_keeps_fresh_peers() {
        let config = PresenceConfig { heartbeat_interval: Duration::from_secs(1), stale_after: Duration::ZERO };
        let mut room = PresenceRoom::new(PeerId::new(), None, &config, 0);
        let peer = remote(1_000);
        let users: BTreeMap<_, _> = [(peer.id, peer)].into();
        room.observe(&users, 1_500);
        assert!(room.prune(1_500).is_empty());
        assert_eq!(room.peer_count(), 1);
    }

    #[test]
    fn test_join_and_leave_ops() {
        let room = room(1_000);
        match room.join_op() {
            DocumentOp::UpsertUser(user) => {
                assert_eq!(user.id, room.local_id());
                assert_eq!(user.connected_at, 1_000);
                assert_eq!(user.name.as_deref(), Some("Alice"));
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(room.leave_op(), DocumentOp::RemoveUser { id: room.local_id() });
    }

    #[test]
    fn test_heartbeat_rate_limited() {
        let mut room = room(0);
        assert!(room.heartbeat(4_999).is_none());
        assert!(room.heartbeat(5_000).is_some());
        assert_eq!(room.local().last_seen, 5_000);
        assert!(room.heartbeat(6_000).is_none());
    }

    #[test]
    fn test_position_refreshes_last_seen() {
        let mut room = room(0);
        room.set_position(GeoPoint::new(1.0, 2.0), 700);
        assert_eq!(room.position(), Some(GeoPoint::new(1.0, 2.0)));
        assert_eq!(room.local().last_seen, 700);
    }

    #[test]
    fn test_hide_show() {
        let mut room = room(0);
        assert!(room.set_hidden(false, 10).is_none());
        assert!(room.set_hidden(true, 20).is_some());
        assert_eq!(room.local().hidden_since, Some(20));
        assert!(room.set_hidden(true, 30).is_none());
        assert!(room.set_hidden(false, 40).is_some());
        assert!(!room.is_hidden());
    }

    #[test]
    fn test_observe_excludes_self_and_reannounces() {
        let mut room = room(0);
        let other = remote(0);
        let mut users = BTreeMap::new();
        users.insert(other.id, other.clone());

        let op = room.observe(&users, 100);
        assert!(matches!(op, Some(DocumentOp::UpsertUser(ref u)) if u.id == room.local_id()));
        assert_eq!(room.peer_count(), 1);

        users.insert(room.local_id(), room.local().clone());
        assert!(room.observe(&users, 200).is_none());
        assert_eq!(room.peer_count(), 1);
        assert!(room.peer(&other.id).is_some());
    }

    #[test]
    fn test_prune_stale_peers() {
        let mut room = room(0);
        let fresh = remote(90_000);
        let stale = remote(10_000);
        let users: BTreeMap<_, _> = [(fresh.id, fresh.clone()), (stale.id, stale.clone())].into();
        room.observe(&users, 100_000);

        let ops = room.prune(100_000);
        assert_eq!(ops, vec![DocumentOp::RemoveUser { id: stale.id }]);
        assert_eq!(room.peer_count(), 1);
        assert!(room.prune(100_000).is_empty());
    }

    #[test]
    fn test_visible_peers() {
        let mut room = room(0);
        let shown = remote(0);
        let mut hidden = remote(0);
        hidden.hidden_since = Some(5);
        let users: BTreeMap<_, _> = [(shown.id, shown.clone()), (hidden.id, hidden)].into();
        room.observe(&users, 0);
        assert_eq!(room.visible_peers(), vec![shown]);
    }
}
