//! nameplane sync — gossip-style anti-entropy between registry peers.
//!
//! Every peer periodically broadcasts checksums for the services it owns;
//! receivers enqueue divergent keys and pull the authoritative snapshot,
//! rewriting instance health locally. Membership is converged elsewhere
//! (write routing for ephemerals, the consistency layer for persistents);
//! this layer converges only health, which is what makes it safe to run
//! continuously.

mod message;
mod queue;
mod reporter;
mod synchronizer;
mod worker;

pub use message::{full_service_name, split_full_service_name, Message, ServiceChecksums, ServiceStatus};
pub use queue::{ServiceKey, UpdateQueue, DEFAULT_QUEUE_CAPACITY};
pub use reporter::StatusReporter;
pub use synchronizer::Synchronizer;
pub use worker::{ChecksumReceiver, UpdateWorker};
