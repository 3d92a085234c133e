//! Peer membership view.
//!
//! The membership layer (outside this crate) discovers peers and marks
//! them alive or dead; the router only ever reads a snapshot through the
//! [`PeerSet`] contract. [`PeerTable`] is the in-memory implementation
//! the membership layer refreshes wholesale.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One registry peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// `host:port` address, the peer's identity.
    pub address: String,
    pub alive: bool,
}

impl Member {
    pub fn alive(address: &str) -> Self {
        Self {
            address: address.to_string(),
            alive: true,
        }
    }
}

/// Read access to the current peer set.
pub trait PeerSet: Send + Sync {
    fn all_members(&self) -> Vec<Member>;

    fn local_address(&self) -> String;
}

/// In-memory member list, replaced wholesale on membership change.
pub struct PeerTable {
    local: String,
    members: RwLock<Vec<Member>>,
}

impl PeerTable {
    /// A table containing only the local peer.
    pub fn solo(local: &str) -> Self {
        Self {
            local: local.to_string(),
            members: RwLock::new(vec![Member::alive(local)]),
        }
    }

    pub fn new(local: &str, members: Vec<Member>) -> Self {
        Self {
            local: local.to_string(),
            members: RwLock::new(members),
        }
    }

    /// Replace the member list with a fresh snapshot.
    pub fn update(&self, members: Vec<Member>) {
        info!(count = members.len(), "peer set updated");
        *self.members.write() = members;
    }

    /// Flip one member's liveness. Returns false for unknown addresses.
    pub fn set_alive(&self, address: &str, alive: bool) -> bool {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| m.address == address) {
            Some(member) => {
                if member.alive != alive {
                    info!(%address, alive, "peer liveness changed");
                    member.alive = alive;
                }
                true
            }
            None => false,
        }
    }
}

impl PeerSet for PeerTable {
    fn all_members(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    fn local_address(&self) -> String {
        self.local.clone()
    }
}
