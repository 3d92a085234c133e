//! nameplane core — domain model and consistency contract of the naming
//! server's registry.
//!
//! This crate holds:
//! - **`instance` / `cluster` / `service`** — the Service → Cluster →
//!   Instance aggregate, with ephemeral and persistent planes
//! - **`consistency`** — the replicated-store contract (`put`/`listen`
//!   driven), the key builder, and a single-node in-memory engine
//! - **`contracts`** — seams to the push broadcaster and health scheduler
//! - **`config` / `switches`** — file configuration and live knobs

pub mod cluster;
pub mod config;
pub mod consistency;
pub mod contracts;
pub mod error;
pub mod instance;
pub mod service;
pub mod switches;

pub use cluster::{Cluster, ClusterConfig, HealthCheckerConfig};
pub use config::NamingConfig;
pub use consistency::{ConsistencyService, Datum, Instances, MemoryConsistency, Record, RecordListener};
pub use contracts::{
    BeatCheckTask, ClientBeat, ClusterCheckKey, HealthScheduler, NoopHealthScheduler, NoopPush,
    PushSink,
};
pub use error::{NamingError, NamingResult};
pub use instance::{Instance, DEFAULT_CLUSTER_NAME};
pub use service::{
    grouped_name, Selector, Service, ServiceSnapshot, DEFAULT_GROUP, DEFAULT_NAMESPACE,
};
pub use switches::{IdGeneratorMode, Switches};
