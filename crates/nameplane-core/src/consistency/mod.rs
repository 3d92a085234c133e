//! Consistency contract — the seam between the registry and whatever
//! replicated-log engine keeps peers in agreement.
//!
//! The registry never mutates its table directly on a write path: it puts a
//! new value under a key and applies the mutation when the change event
//! fires back. Values are either a service snapshot (meta keys) or an
//! instance list (iplist keys), carried as a tagged [`Record`].

pub mod keys;
mod memory;

pub use memory::MemoryConsistency;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{NamingError, NamingResult};
use crate::instance::Instance;
use crate::service::ServiceSnapshot;

/// Instance-list value stored under iplist keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Instances {
    pub instance_list: Vec<Instance>,
}

/// A value in the consistency store.
#[derive(Debug, Clone)]
pub enum Record {
    /// Service snapshot, stored under a meta key.
    Metadata(ServiceSnapshot),
    /// Instance list, stored under an iplist key.
    Instances(Instances),
}

impl Record {
    pub fn to_json(&self) -> NamingResult<String> {
        let result = match self {
            Record::Metadata(snapshot) => serde_json::to_string(snapshot),
            Record::Instances(instances) => serde_json::to_string(instances),
        };
        result.map_err(|e| NamingError::Consistency(format!("serialize record: {e}")))
    }

    /// Deserialize a record, picking the value type from the key family.
    pub fn from_json_for_key(key: &str, json: &str) -> NamingResult<Self> {
        if keys::match_instance_list_key_prefix(key) {
            let instances: Instances = serde_json::from_str(json)
                .map_err(|e| NamingError::Consistency(format!("deserialize {key}: {e}")))?;
            Ok(Record::Instances(instances))
        } else {
            let snapshot: ServiceSnapshot = serde_json::from_str(json)
                .map_err(|e| NamingError::Consistency(format!("deserialize {key}: {e}")))?;
            Ok(Record::Metadata(snapshot))
        }
    }
}

/// A keyed record plus its write stamp.
#[derive(Debug, Clone)]
pub struct Datum {
    pub key: String,
    pub value: Record,
    pub timestamp: u64,
}

/// Asynchronous observer of one key or of a key prefix.
///
/// Callbacks are delivered from the consistency layer's notifier, never
/// from the writer's stack.
#[async_trait]
pub trait RecordListener: Send + Sync {
    /// Whether this listener cares about `key`.
    fn interests(&self, key: &str) -> bool;

    /// Whether an unlisten of `key` should detach this listener.
    fn match_unlisten_key(&self, key: &str) -> bool;

    async fn on_change(&self, key: &str, value: Record) -> NamingResult<()>;

    async fn on_delete(&self, key: &str) -> NamingResult<()>;
}

/// The consistency engine contract.
#[async_trait]
pub trait ConsistencyService: Send + Sync {
    async fn put(&self, key: &str, value: Record) -> NamingResult<()>;

    async fn remove(&self, key: &str) -> NamingResult<()>;

    async fn get(&self, key: &str) -> NamingResult<Option<Datum>>;

    /// Subscribe to a key, or to every key under a prefix. Idempotent for
    /// the same key and listener.
    async fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) -> NamingResult<()>;

    async fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) -> NamingResult<()>;
}
