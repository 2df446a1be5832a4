//! Matching pass output: who sees what

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::interest::ids::{PeerId, ReplicaId};

/// Peers currently interested in one replica.
///
/// A true set: a peer matched by several rules or handlers appears once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestPeerSet {
    peers: HashSet<PeerId>,
}

impl InterestPeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the peer was not already present
    #[inline]
    pub fn insert(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    #[inline]
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    /// Peers in ascending id order
    pub fn to_sorted_vec(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.iter().copied().collect();
        peers.sort_unstable();
        peers
    }

    pub fn extend<I: IntoIterator<Item = PeerId>>(&mut self, peers: I) {
        self.peers.extend(peers);
    }
}

impl FromIterator<PeerId> for InterestPeerSet {
    fn from_iter<I: IntoIterator<Item = PeerId>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}

/// Snapshot of interest for one tick: every replica with a live attribute
/// maps to the set of peers interested in it.
///
/// A replica nobody matches is present with an empty set, so a consumer can
/// tell "lost all visibility" (empty) apart from "replica gone" (absent).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestMatchResult {
    entries: HashMap<ReplicaId, InterestPeerSet>,
}

impl InterestMatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Make sure the replica has an entry, even if nobody is interested
    #[inline]
    pub fn ensure_replica(&mut self, replica: ReplicaId) -> &mut InterestPeerSet {
        self.entries.entry(replica).or_default()
    }

    #[inline]
    pub fn insert_match(&mut self, replica: ReplicaId, peer: PeerId) -> bool {
        self.ensure_replica(replica).insert(peer)
    }

    pub fn get(&self, replica: ReplicaId) -> Option<&InterestPeerSet> {
        self.entries.get(&replica)
    }

    /// `true` if `peer` is interested in `replica`
    pub fn is_interested(&self, replica: ReplicaId, peer: PeerId) -> bool {
        self.entries
            .get(&replica)
            .map(|set| set.contains(peer))
            .unwrap_or(false)
    }

    /// Replicas visible to one peer, ascending
    pub fn replicas_for_peer(&self, peer: PeerId) -> Vec<ReplicaId> {
        let mut replicas: Vec<ReplicaId> = self
            .entries
            .iter()
            .filter(|(_, set)| set.contains(peer))
            .map(|(id, _)| *id)
            .collect();
        replicas.sort_unstable();
        replicas
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, &InterestPeerSet)> {
        self.entries.iter().map(|(id, set)| (*id, set))
    }

    /// Number of replicas tracked (including those with empty sets)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total (replica, peer) pairs
    pub fn matched_pairs(&self) -> usize {
        self.entries.values().map(InterestPeerSet::len).sum()
    }

    /// Compare against the previous pass and report what changed
    pub fn diff(&self, previous: &InterestMatchResult) -> InterestDelta {
        let mut delta = InterestDelta::default();

        for (replica, current) in &self.entries {
            match previous.entries.get(replica) {
                Some(before) => {
                    for peer in current.iter() {
                        if !before.contains(peer) {
                            delta.joined.push((*replica, peer));
                        }
                    }
                    for peer in before.iter() {
                        if !current.contains(peer) {
                            delta.left.push((*replica, peer));
                        }
                    }
                    if current.is_empty() && !before.is_empty() {
                        delta.lost_visibility.push(*replica);
                    }
                }
                None => {
                    delta.joined.extend(current.iter().map(|peer| (*replica, peer)));
                }
            }
        }

        for (replica, before) in &previous.entries {
            if !self.entries.contains_key(replica) {
                delta.left.extend(before.iter().map(|peer| (*replica, peer)));
                delta.removed.push(*replica);
            }
        }

        delta.joined.sort_unstable();
        delta.left.sort_unstable();
        delta.lost_visibility.sort_unstable();
        delta.removed.sort_unstable();
        delta
    }
}

/// Join/leave events between two consecutive passes. All lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestDelta {
    /// Peer became interested in replica
    pub joined: Vec<(ReplicaId, PeerId)>,
    /// Peer stopped being interested (including because the replica is gone)
    pub left: Vec<(ReplicaId, PeerId)>,
    /// Replicas that had at least one peer and now have none
    pub lost_visibility: Vec<ReplicaId>,
    /// Replicas no longer tracked at all
    pub removed: Vec<ReplicaId>,
}

impl InterestDelta {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
            && self.left.is_empty()
            && self.lost_visibility.is_empty()
            && self.removed.is_empty()
    }

    #[inline]
    pub fn is_join(&self, replica: ReplicaId, peer: PeerId) -> bool {
        self.joined.binary_search(&(replica, peer)).is_ok()
    }
}
