//! Wire messages exchanged during anti-entropy.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use nameplane_core::Service;

/// Opaque peer-to-peer envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub data: String,
}

impl Message {
    pub fn new(data: String) -> Self {
        Self { data }
    }
}

/// Checksum report for one namespace, broadcast by the responsible peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceChecksums {
    pub namespace_id: String,
    /// Service name → checksum. Sorted so reports serialize stably.
    pub checksums: BTreeMap<String, String>,
}

impl ServiceChecksums {
    pub fn new(namespace_id: &str) -> Self {
        Self {
            namespace_id: namespace_id.to_string(),
            checksums: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, service_name: &str, checksum: &str) {
        if service_name.is_empty() || checksum.is_empty() {
            tracing::warn!(%service_name, "skipping empty service name or checksum in report");
            return;
        }
        self.checksums.insert(service_name.to_string(), checksum.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }
}

/// Authoritative service status returned to pulling peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceStatus {
    pub dom: String,
    /// `ip:port_healthy` entries.
    pub ips: Vec<String>,
    pub checksum: String,
    pub last_ref_time: i64,
}

impl ServiceStatus {
    /// Build the status payload the serving side returns for a pull.
    pub fn of(service: &Service) -> Self {
        Self {
            dom: service.name().to_string(),
            ips: service
                .all_ips()
                .iter()
                .map(|i| format!("{}_{}", i.ip_addr(), i.healthy))
                .collect(),
            checksum: service.checksum(),
            last_ref_time: service.last_modified_millis(),
        }
    }

    /// `ip:port` → healthy, parsed from the `ips` entries. Malformed
    /// entries are skipped.
    pub fn health_map(&self) -> HashMap<String, bool> {
        self.ips
            .iter()
            .filter_map(|entry| {
                let (addr, healthy) = entry.rsplit_once('_')?;
                Some((addr.to_string(), healthy.parse::<bool>().ok()?))
            })
            .collect()
    }
}

/// `<namespace>##<group::name>`, the pull-request key.
pub fn full_service_name(namespace_id: &str, service_name: &str) -> String {
    format!("{namespace_id}##{service_name}")
}

pub fn split_full_service_name(full: &str) -> Option<(&str, &str)> {
    full.split_once("##")
}
