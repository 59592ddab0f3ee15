// ring-node/src/routing/mod.rs
//! Routing state of one peer: the prefix table, the leaf set and the gate that
//! holds lookups back until the peer has bootstrapped or joined.

pub mod leaf_set;
pub mod table;

use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::id::{Identifier, PeerIdentity};
use crate::transport::Outbound;
use crate::wire::{JoinRequest, Message};

pub use leaf_set::LeafSet;
pub use table::RoutingTable;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routing information is not initialized")]
    NotInitialized,
    #[error("routing information was already initialized")]
    AlreadyInitialized,
}

/// Whether `candidate` should replace `best` as the closest peer to `key`.
///
/// Strictly smaller distance wins. On a tie the candidate wins only when it
/// sits counterclockwise of the key, so every peer resolves a tie the same way.
pub(crate) fn closer_to(key: Identifier, candidate: Identifier, best: Identifier) -> bool {
    let (d_candidate, d_best) = (candidate.distance_to(key), best.distance_to(key));
    d_candidate < d_best
        || (d_candidate == d_best && candidate != best && candidate.clockwise_to(key) == d_candidate)
}

#[derive(Debug, Clone)]
struct RoutingState {
    me: PeerIdentity,
    leaves: LeafSet,
    table: RoutingTable,
}

impl RoutingState {
    fn alone(me: PeerIdentity) -> Self {
        Self {
            leaves: LeafSet::new(me.clone()),
            table: RoutingTable::new(me.clone()),
            me,
        }
    }

    /// Closest known peer to `key`, never one of `excluded`. The owner itself
    /// is always a candidate.
    fn closest(&self, key: Identifier, excluded: &[Identifier]) -> PeerIdentity {
        let allowed = |peer: &&PeerIdentity| !excluded.contains(&peer.id);
        let mut best = self.leaves.left().filter(allowed).unwrap_or(&self.me);
        let candidates = std::iter::once(&self.me)
            .chain(self.leaves.right().filter(allowed))
            .chain(self.table.others().filter(allowed));
        for candidate in candidates {
            if closer_to(key, candidate.id, best.id) {
                best = candidate;
            }
        }
        best.clone()
    }

    fn peer_set(&self, include_self: bool) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = Vec::new();
        let me = include_self.then_some(&self.me);
        let ordered = self
            .leaves
            .left()
            .into_iter()
            .chain(me)
            .chain(self.leaves.right())
            .chain(self.table.others());
        for peer in ordered {
            if !peers.contains(peer) {
                peers.push(peer.clone());
            }
        }
        peers
    }

    fn add(&mut self, peer: PeerIdentity) -> bool {
        if peer == self.me {
            return false;
        }
        let was_leaf = self.leaves.contains(&peer);
        let mut added = self.table.add(peer.clone());
        if let Some(evicted) = self.leaves.add(peer.clone()) {
            self.table.add(evicted);
            added = true;
        }
        added || (!was_leaf && self.leaves.contains(&peer))
    }

    fn remove(&mut self, peer: &PeerIdentity) -> bool {
        let from_leaves = self.leaves.remove(peer);
        let from_table = self.table.remove(peer);
        self.rebuild_leaves();
        from_leaves || from_table
    }

    fn rebuild_leaves(&mut self) {
        for peer in self.peer_set(false) {
            self.leaves.add(peer);
        }
    }
}

/// Routing table, leaf set and initialization gate of the local peer.
///
/// Every operation takes the same lock, so a lookup never observes a half
/// applied membership change. The lock is never held across an await.
pub struct RoutingInformation {
    state: Mutex<Option<RoutingState>>,
    ready: watch::Sender<bool>,
    wait_limit: Option<Duration>,
}

impl RoutingInformation {
    /// `wait_limit` bounds how long lookups wait for initialization; `None`
    /// waits forever.
    pub fn new(wait_limit: Option<Duration>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Mutex::new(None),
            ready,
            wait_limit,
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<RoutingState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        *self.ready.borrow()
    }

    async fn wait_ready(&self) -> Result<(), RoutingError> {
        let mut ready = self.ready.subscribe();
        let wait = ready.wait_for(|ready| *ready);
        let outcome = match self.wait_limit {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| RoutingError::NotInitialized)?
                .map(|_| ()),
            None => wait.await.map(|_| ()),
        };
        outcome.map_err(|_| RoutingError::NotInitialized)
    }

    /// Initialize once, either alone (`join` is `None`) or from the routing
    /// knowledge accumulated by a join request.
    ///
    /// A joining peer announces itself to every peer it learned about before
    /// the gate opens; peers that cannot be reached are dropped.
    pub async fn initialize(
        &self,
        me: PeerIdentity,
        join: Option<JoinRequest>,
        outbound: &dyn Outbound,
    ) -> Result<(), RoutingError> {
        let announce = {
            let mut guard = self.state();
            if guard.is_some() {
                return Err(RoutingError::AlreadyInitialized);
            }
            let state = match join {
                None => RoutingState::alone(me.clone()),
                Some(join) => {
                    let (leaves, table) = join.into_routing();
                    let mut state = RoutingState { me: me.clone(), leaves, table };
                    state.rebuild_leaves();
                    state
                }
            };
            let peers = state.peer_set(false);
            *guard = Some(state);
            peers
        };

        if !announce.is_empty() {
            let broadcast = Message::PeerBroadcast {
                origin: me.clone(),
                peers: announce.clone(),
            };
            for peer in &announce {
                if !outbound.send(&peer.address(), &broadcast, false).await {
                    warn!("Peer {} unreachable during join broadcast, removing", peer);
                    self.remove_peer(peer);
                }
            }
        }

        self.ready.send_replace(true);
        info!("Routing initialized for {}\n{}", me.id, self.describe());
        Ok(())
    }

    /// Closest known peer to `key`, waiting for initialization first.
    pub async fn lookup(&self, key: Identifier) -> Result<PeerIdentity, RoutingError> {
        self.lookup_excluding(key, &[]).await
    }

    /// Like `lookup`, but skipping peers that already failed in this attempt,
    /// even if a broadcast has added them back in the meantime.
    pub async fn lookup_excluding(
        &self,
        key: Identifier,
        excluded: &[Identifier],
    ) -> Result<PeerIdentity, RoutingError> {
        self.wait_ready().await?;
        self.state()
            .as_ref()
            .map(|state| state.closest(key, excluded))
            .ok_or(RoutingError::NotInitialized)
    }

    /// Add this peer's whole view, itself included, to a join request in flight.
    pub async fn attach_to_join(&self, join: &mut JoinRequest) -> Result<(), RoutingError> {
        self.wait_ready().await?;
        let peers = self
            .state()
            .as_ref()
            .map(|state| state.peer_set(true))
            .ok_or(RoutingError::NotInitialized)?;
        join.add_relevant_entries(peers);
        Ok(())
    }

    /// Returns whether the peer was recorded anywhere. Ignored before initialization.
    pub fn add_peer(&self, peer: PeerIdentity) -> bool {
        match self.state().as_mut() {
            Some(state) => state.add(peer),
            None => false,
        }
    }

    /// Drop a peer from the table and leaf set, then backfill the leaf set
    /// from what remains.
    pub fn remove_peer(&self, peer: &PeerIdentity) -> bool {
        match self.state().as_mut() {
            Some(state) => state.remove(peer),
            None => false,
        }
    }

    /// Every known peer: left, self (optionally), right, then table entries.
    pub fn peer_set(&self, include_self: bool) -> Vec<PeerIdentity> {
        self.state()
            .as_ref()
            .map(|state| state.peer_set(include_self))
            .unwrap_or_default()
    }

    pub fn leaf_set(&self) -> Option<LeafSet> {
        self.state().as_ref().map(|state| state.leaves.clone())
    }

    pub fn table(&self) -> Option<RoutingTable> {
        self.state().as_ref().map(|state| state.table.clone())
    }

    /// Human-readable dump for logs and the `routing` command.
    pub fn describe(&self) -> String {
        let guard = self.state();
        let Some(state) = guard.as_ref() else {
            return "  Not yet initialized.".to_string();
        };
        let mut out = format!("  Leaf Set: {}\n  Routing Table:", state.leaves);
        for row in state.table.to_string().lines() {
            let _ = write!(out, "\n  {}", row);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn peer(id: &str) -> PeerIdentity {
        PeerIdentity::new(id.parse().unwrap(), "127.0.0.1", 1000 + id.len() as u16)
    }

    fn key(id: &str) -> Identifier {
        id.parse().unwrap()
    }

    /// Records broadcasts and fails for the listed identifiers.
    #[derive(Default)]
    struct FakeOutbound {
        unreachable: HashSet<String>,
        sent: Mutex<Vec<(String, Message)>>,
    }

    #[async_trait]
    impl Outbound for FakeOutbound {
        async fn send(&self, address: &str, message: &Message, _start: bool) -> bool {
            if let Message::PeerBroadcast { .. } = message {
                self.sent.lock().unwrap().push((address.to_string(), message.clone()));
            }
            !self.unreachable.contains(address)
        }
    }

    fn addressed(id: &str, port: u16) -> PeerIdentity {
        PeerIdentity::new(id.parse().unwrap(), "127.0.0.1", port)
    }

    async fn alone(id: &str) -> RoutingInformation {
        let routing = RoutingInformation::new(Some(Duration::from_secs(1)));
        routing
            .initialize(peer(id), None, &FakeOutbound::default())
            .await
            .unwrap();
        routing
    }

    #[test]
    fn test_closer_to_breaks_ties_counterclockwise() {
        // 8800 is 0x800 from both 8000 and 9000.
        assert!(closer_to(key("8800"), key("8000"), key("9000")));
        assert!(!closer_to(key("8800"), key("9000"), key("8000")));
        assert!(closer_to(key("8800"), key("8900"), key("8000")));
        assert!(!closer_to(key("8800"), key("8000"), key("8000")));
    }

    #[tokio::test]
    async fn test_lookup_waits_for_gate_and_times_out() {
        let routing = RoutingInformation::new(Some(Duration::from_millis(50)));
        assert!(!routing.is_initialized());
        assert_eq!(routing.lookup(key("1234")).await, Err(RoutingError::NotInitialized));
    }

    #[tokio::test]
    async fn test_blocked_lookup_resumes_after_initialize() {
        let routing = std::sync::Arc::new(RoutingInformation::new(None));
        let waiting = {
            let routing = routing.clone();
            tokio::spawn(async move { routing.lookup(key("0001")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        routing
            .initialize(peer("4000"), None, &FakeOutbound::default())
            .await
            .unwrap();
        assert_eq!(waiting.await.unwrap(), Ok(peer("4000")));
    }

    #[tokio::test]
    async fn test_lookup_excluding_skips_failed_peers() {
        let routing = alone("8000").await;
        routing.add_peer(peer("1000"));
        routing.add_peer(peer("9000"));
        routing.add_peer(peer("8800"));

        assert_eq!(routing.lookup(key("8900")).await, Ok(peer("8800")));
        assert_eq!(routing.lookup_excluding(key("8900"), &[key("8800")]).await, Ok(peer("9000")));
        assert_eq!(
            routing.lookup_excluding(key("8900"), &[key("8800"), key("9000")]).await,
            Ok(peer("8000"))
        );
        // Excluding the owner has no effect.
        assert_eq!(routing.lookup_excluding(key("8001"), &[key("8000")]).await, Ok(peer("8000")));
        assert_eq!(routing.lookup_excluding(key("1001"), &[key("1000")]).await, Ok(peer("8000")));
    }

    #[tokio::test]
    async fn test_initialize_is_terminal() {
        let routing = alone("4000").await;
        let again = routing
            .initialize(peer("4000"), None, &FakeOutbound::default())
            .await;
        assert_eq!(again, Err(RoutingError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn test_lookup_is_deterministic() {
        let routing = alone("8000").await;
        for id in ["1000", "f000", "8100", "7f00", "c000"] {
            routing.add_peer(peer(id));
        }
        let first = routing.lookup(key("0500")).await.unwrap();
        for _ in 0..10 {
            assert_eq!(routing.lookup(key("0500")).await.unwrap(), first);
        }
        assert_eq!(first, peer("1000"));
    }

    #[tokio::test]
    async fn test_lookup_tie_prefers_counterclockwise_peer() {
        let routing = alone("8000").await;
        routing.add_peer(peer("9000"));
        assert_eq!(routing.lookup(key("8800")).await.unwrap(), peer("8000"));

        // Same pair seen from the other side must agree.
        let other = alone("9000").await;
        other.add_peer(peer("8000"));
        assert_eq!(other.lookup(key("8800")).await.unwrap(), peer("8000"));
    }

    #[tokio::test]
    async fn test_add_peer_rehomes_evicted_leaf() {
        let routing = alone("8000").await;
        assert!(routing.add_peer(peer("1000")));
        assert!(routing.add_peer(peer("f000")));
        // 8100 shares no slot with anyone yet and pushes f000 out of the leaf set.
        assert!(routing.add_peer(peer("8100")));
        let leaves = routing.leaf_set().unwrap();
        assert_eq!(leaves.right(), Some(&peer("8100")));
        assert!(routing.peer_set(false).contains(&peer("f000")));
        assert!(!routing.add_peer(peer("8000")));
    }

    #[tokio::test]
    async fn test_add_peer_reports_new_leaf_in_occupied_slot() {
        let routing = alone("8000").await;
        assert!(routing.add_peer(peer("1000")));
        // 1100 loses slot (0, 1) to 1000 but still becomes the left leaf, so
        // the owner has to reconsider its files.
        assert!(routing.add_peer(peer("1100")));
        let leaves = routing.leaf_set().unwrap();
        assert_eq!(leaves.left(), Some(&peer("1100")));
        assert_eq!(leaves.right(), Some(&peer("1000")));
        assert_eq!(routing.table().unwrap().get(0, 1), Some(&peer("1000")));
        assert!(!routing.add_peer(peer("1100")));
    }

    #[tokio::test]
    async fn test_add_peer_reports_slot_loss() {
        let routing = alone("8000").await;
        routing.add_peer(peer("1000"));
        routing.add_peer(peer("f000"));
        assert!(routing.add_peer(peer("0100")));
        // 0500 lands in slot (0, 0) which 0100 already holds and is farther
        // than both leaves: it is not recorded anywhere.
        assert!(!routing.add_peer(peer("0500")));
        assert!(!routing.peer_set(false).contains(&peer("0500")));
    }

    #[tokio::test]
    async fn test_remove_peer_backfills_leaf_set() {
        let routing = alone("8000").await;
        for id in ["1000", "f000", "9000", "7000"] {
            routing.add_peer(peer(id));
        }
        assert_eq!(routing.leaf_set().unwrap().right(), Some(&peer("9000")));
        assert!(routing.remove_peer(&peer("9000")));
        assert_eq!(routing.leaf_set().unwrap().right(), Some(&peer("f000")));
        assert!(!routing.remove_peer(&peer("9000")));
    }

    #[tokio::test]
    async fn test_peer_set_order_and_self() {
        let routing = alone("8000").await;
        routing.add_peer(peer("1000"));
        routing.add_peer(peer("9000"));
        assert_eq!(routing.peer_set(false), vec![peer("1000"), peer("9000")]);
        assert_eq!(
            routing.peer_set(true),
            vec![peer("1000"), peer("8000"), peer("9000")]
        );
    }

    #[tokio::test]
    async fn test_join_initialize_broadcasts_and_prunes() {
        let entry = alone("1000").await;
        entry.add_peer(addressed("f000", 2));
        let mut join = JoinRequest::new(addressed("8000", 3));
        entry.attach_to_join(&mut join).await.unwrap();

        let outbound = FakeOutbound {
            unreachable: ["127.0.0.1:2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let joining = RoutingInformation::new(None);
        joining
            .initialize(addressed("8000", 3), Some(join), &outbound)
            .await
            .unwrap();

        let sent = outbound.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        match &sent[0].1 {
            Message::PeerBroadcast { origin, peers } => {
                assert_eq!(origin, &peer("8000"));
                assert!(peers.contains(&peer("1000")));
                assert!(!peers.contains(&peer("8000")));
            }
            other => panic!("unexpected message {other:?}"),
        }
        let leaves = joining.leaf_set().unwrap();
        assert_eq!(leaves.left(), Some(&peer("1000")));
        assert_eq!(leaves.right(), Some(&peer("1000")));
        assert!(!joining.peer_set(false).contains(&peer("f000")));
        assert!(joining.describe().contains("1000 <- 8000 -> 1000"));
    }
}
