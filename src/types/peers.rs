/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica set and the Byzantine quorum arithmetic shared by all replicas.
//!
//! Every replica is uniquely identified by an Ed25519 public key. The [`PeerSet`] keeps the keys in
//! ascending byte order so that all replicas agree on the position of each peer, and therefore on
//! which peer is the primary of a given view.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ed25519_dalek::VerifyingKey;

use super::basic::ViewNumber;

/// The largest number of faulty replicas a cluster of `peers_size` replicas can tolerate:
/// `f = ⌊(n − 1) / 3⌋`.
pub fn faulty_nodes_bound(peers_size: usize) -> usize {
    peers_size.saturating_sub(1) / 3
}

/// The smallest set of replicas guaranteed to contain at least one honest node: `f + 1`.
pub fn honest_member_size(peers_size: usize) -> usize {
    faulty_nodes_bound(peers_size) + 1
}

/// The smallest set of replicas guaranteed to contain a majority of honest nodes: `2f + 1`. This is
/// the PBFT quorum; the exact formula must be shared by all replicas.
pub fn honest_majority_size(peers_size: usize) -> usize {
    faulty_nodes_bound(peers_size) * 2 + 1
}

/// The textual form of a peer's identity, used as the sender segment of storage keys, as the caller
/// id seen by the CRUD service, and in log lines.
pub fn peer_id(peer: &VerifyingKey) -> String {
    STANDARD_NO_PAD.encode(peer.to_bytes())
}

/// Stores the identities of the replicas in the cluster.
///
/// `PeerSet` internally maintains the list of peers in ascending order of their `VerifyingKey`s, so
/// every replica computes the same [position](PeerSet::position) for each peer and the same
/// [primary](PeerSet::primary) for each view.
#[derive(Clone, PartialEq)]
pub struct PeerSet {
    // The verifying keys of peers are included here in ascending order.
    peers: Vec<VerifyingKey>,
}

impl Default for PeerSet {
    fn default() -> Self {
        PeerSet::new()
    }
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> PeerSet {
        Self { peers: Vec::new() }
    }

    /// Put `peer` into the peer set, placing it in a position that preserves the ordering of peers.
    /// Putting a peer that is already in the set is a no-op.
    pub fn put(&mut self, peer: &VerifyingKey) {
        let peer_bytes = peer.to_bytes();
        if let Err(insert_pos) = self
            .peers
            .binary_search_by(|p| p.to_bytes().cmp(&peer_bytes))
        {
            self.peers.insert(insert_pos, *peer);
        }
    }

    /// Remove `peer` from the peer set, if it actually is in the peer set.
    pub fn remove(&mut self, peer: &VerifyingKey) -> Option<VerifyingKey> {
        let peer_bytes = peer.to_bytes();
        if let Ok(pos) = self
            .peers
            .binary_search_by(|p| p.to_bytes().cmp(&peer_bytes))
        {
            Some(self.peers.remove(pos))
        } else {
            None
        }
    }

    pub fn contains(&self, peer: &VerifyingKey) -> bool {
        self.position(peer).is_some()
    }

    /// Get the position of `peer` in the ascending key order, if it is in the peer set.
    pub fn position(&self, peer: &VerifyingKey) -> Option<usize> {
        let peer_bytes = peer.to_bytes();
        self.peers
            .binary_search_by(|p| p.to_bytes().cmp(&peer_bytes))
            .ok()
    }

    /// The primary of `view` is the peer at position `view mod n`.
    ///
    /// # Panics
    ///
    /// Panics if the peer set is empty.
    pub fn primary(&self, view: ViewNumber) -> VerifyingKey {
        self.peers[(view.int() % self.peers.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterate through the peers' verifying keys in ascending key order.
    pub fn iter(&self) -> std::slice::Iter<'_, VerifyingKey> {
        self.peers.iter()
    }
}
