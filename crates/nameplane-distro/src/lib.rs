//! nameplane distro — ownership partitioning of ephemeral state across
//! registry peers.
//!
//! Each service name is hashed onto the alive peer set; exactly one peer
//! is responsible for reporting that service's ephemeral state. The
//! router answers the single question "is this peer responsible for key
//! K?" plus the forwarding variant "who is?".

mod members;
mod router;

pub use members::{Member, PeerSet, PeerTable};
pub use router::{DistroRouter, LocalPeerState};
