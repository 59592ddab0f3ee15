// ring-node/src/routing/leaf_set.rs
use std::fmt;

use crate::id::{Identifier, PeerIdentity};

/// The owner's nearest neighbours: `left` counterclockwise, `right` clockwise.
///
/// With exactly one other peer in the ring both sides hold that peer.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafSet {
    left: Option<PeerIdentity>,
    owner: PeerIdentity,
    right: Option<PeerIdentity>,
}

impl LeafSet {
    pub fn new(owner: PeerIdentity) -> Self {
        Self {
            left: None,
            owner,
            right: None,
        }
    }

    pub fn from_parts(left: Option<PeerIdentity>, owner: PeerIdentity, right: Option<PeerIdentity>) -> Self {
        Self { left, owner, right }
    }

    pub fn left(&self) -> Option<&PeerIdentity> {
        self.left.as_ref()
    }

    pub fn owner(&self) -> &PeerIdentity {
        &self.owner
    }

    pub fn right(&self) -> Option<&PeerIdentity> {
        self.right.as_ref()
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.left.as_ref() == Some(peer) || self.right.as_ref() == Some(peer)
    }

    /// Offer a peer to the leaf set.
    ///
    /// Returns the neighbour it displaced, which the caller has to re-home
    /// (normally in the routing table).
    pub fn add(&mut self, peer: PeerIdentity) -> Option<PeerIdentity> {
        if peer == self.owner {
            return None;
        }
        let me = self.owner.id;
        match (&self.left, &self.right) {
            (Some(left), Some(right)) if left == right => {
                if left == &peer {
                    return None;
                }
                if me.clockwise_to(right.id) > me.clockwise_to(peer.id) {
                    self.right = Some(peer);
                } else {
                    self.left = Some(peer);
                }
                None
            }
            (Some(left), Some(right)) => {
                if left == &peer || right == &peer {
                    return None;
                }
                if me.clockwise_to(right.id) > me.clockwise_to(peer.id) {
                    self.right.replace(peer)
                } else if me.counterclockwise_to(left.id) > me.counterclockwise_to(peer.id) {
                    self.left.replace(peer)
                } else {
                    None
                }
            }
            _ => {
                self.left = Some(peer.clone());
                self.right = Some(peer);
                None
            }
        }
    }

    /// Clear whichever sides hold `peer`. Nothing is backfilled.
    pub fn remove(&mut self, peer: &PeerIdentity) -> bool {
        let mut removed = false;
        if self.left.as_ref() == Some(peer) {
            self.left = None;
            removed = true;
        }
        if self.right.as_ref() == Some(peer) {
            self.right = None;
            removed = true;
        }
        removed
    }

    /// Closest of left, owner and right to `key`, provided the key lies within
    /// the arc the leaf set spans. `None` tells the caller to consult the
    /// routing table instead.
    pub fn closest_leaf(&self, key: Identifier) -> Option<&PeerIdentity> {
        let me = self.owner.id;
        let (left, right) = match (&self.left, &self.right) {
            (Some(left), Some(right)) => (left, right),
            // Alone on the ring: everything is ours.
            _ => return Some(&self.owner),
        };
        let covered = left == right
            || me.clockwise_to(key) <= me.clockwise_to(right.id)
            || me.counterclockwise_to(key) <= me.counterclockwise_to(left.id);
        if !covered {
            return None;
        }
        let mut best = left;
        for candidate in [&self.owner, right] {
            if super::closer_to(key, candidate.id, best.id) {
                best = candidate;
            }
        }
        Some(best)
    }
}

impl fmt::Display for LeafSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |side: &Option<PeerIdentity>| match side {
            Some(peer) => peer.id.to_string(),
            None => "NULL".to_string(),
        };
        write!(f, "{} <- {} -> {}", show(&self.left), self.owner.id, show(&self.right))
    }
}
