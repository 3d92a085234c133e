//! Peer transport contract for anti-entropy.
//!
//! The HTTP layer that actually moves bytes between peers lives outside
//! this crate. Failures are transient by definition here: callers log,
//! skip the item, and move on.

use async_trait::async_trait;

use crate::message::Message;

/// Fire-and-forget send plus authoritative-status pull.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Deliver a checksum report to a peer.
    async fn send(&self, peer_addr: &str, message: Message) -> anyhow::Result<()>;

    /// Fetch the authoritative status of `full_service_name`
    /// (`<namespace>##<group::name>`) from a peer.
    async fn get(&self, peer_addr: &str, full_service_name: &str) -> anyhow::Result<Message>;
}
