//! Distro router — hash-based ownership decisions.
//!
//! Service names are hashed (FNV-1a) onto the sorted alive-peer list.
//! When the peer set is degraded (empty, or the local peer missing from
//! it) the router answers "responsible" so the node keeps serving rather
//! than dropping work.

use std::sync::Arc;

use crate::members::{Member, PeerSet};

/// Snapshot of this peer's view of the cluster.
#[derive(Debug, Clone)]
pub struct LocalPeerState {
    pub address: String,
    pub members: Vec<Member>,
}

/// Decides which peer owns responsibility for a service name.
pub struct DistroRouter {
    peers: Arc<dyn PeerSet>,
}

impl DistroRouter {
    pub fn new(peers: Arc<dyn PeerSet>) -> Self {
        Self { peers }
    }

    fn alive_sorted(&self) -> Vec<String> {
        let mut alive: Vec<String> = self
            .peers
            .all_members()
            .into_iter()
            .filter(|m| m.alive)
            .map(|m| m.address)
            .collect();
        alive.sort();
        alive
    }

    /// Whether this peer owns responsibility for `service_name`.
    pub fn responsible(&self, service_name: &str) -> bool {
        let alive = self.alive_sorted();
        if alive.is_empty() {
            return true;
        }
        let local = self.peers.local_address();
        let Some(position) = alive.iter().position(|a| *a == local) else {
            return true;
        };
        hash_key(service_name) as usize % alive.len() == position
    }

    /// Address of the peer that owns `service_name`, for forwarding
    /// writes upstream. Falls back to the local address on a degraded
    /// peer set.
    pub fn responsible_server(&self, service_name: &str) -> String {
        let alive = self.alive_sorted();
        if alive.is_empty() {
            return self.peers.local_address();
        }
        alive[hash_key(service_name) as usize % alive.len()].clone()
    }

    /// The local peer's cluster-state snapshot.
    pub fn local_state(&self) -> LocalPeerState {
        LocalPeerState {
            address: self.peers.local_address(),
            members: self.peers.all_members(),
        }
    }
}

#[inline]
fn hash_key(key: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
