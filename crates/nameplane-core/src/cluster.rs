//! Cluster — a named bucket of instances inside a service.
//!
//! Every service partitions its instances into clusters for routing and
//! affinity. A cluster keeps two disjoint instance sets, one per plane:
//! ephemeral (heartbeat-maintained) and persistent (externally checked).
//! The plane is fixed at registration time.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NamingError, NamingResult};
use crate::instance::Instance;

fn cluster_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9a-zA-Z-]+$").expect("valid pattern"))
}

/// Kind of health probe run against persistent instances of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckerKind {
    #[default]
    Tcp,
    Http,
    None,
}

/// Health-check parameters for the persistent plane of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckerConfig {
    pub kind: CheckerKind,
    /// Port probed when `use_instance_port` is false.
    pub check_port: u16,
    pub use_instance_port: bool,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            kind: CheckerKind::Tcp,
            check_port: 80,
            use_instance_port: true,
        }
    }
}

/// Serializable cluster settings, carried inside service snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub name: String,
    pub health_checker: HealthCheckerConfig,
    pub site_group: String,
}

/// A named instance bucket with one instance set per plane, keyed by
/// `ip:port`.
pub struct Cluster {
    name: String,
    checker: RwLock<HealthCheckerConfig>,
    site_group: RwLock<String>,
    ephemeral: RwLock<HashMap<String, Instance>>,
    persistent: RwLock<HashMap<String, Instance>>,
}

impl Cluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checker: RwLock::new(HealthCheckerConfig::default()),
            site_group: RwLock::new(String::new()),
            ephemeral: RwLock::new(HashMap::new()),
            persistent: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let cluster = Self::new(&config.name);
        *cluster.checker.write() = config.health_checker.clone();
        *cluster.site_group.write() = config.site_group.clone();
        cluster
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> ClusterConfig {
        ClusterConfig {
            name: self.name.clone(),
            health_checker: self.checker.read().clone(),
            site_group: self.site_group.read().clone(),
        }
    }

    /// Adopt the settings of an incoming cluster definition.
    pub fn update_config(&self, config: &ClusterConfig) {
        let mut checker = self.checker.write();
        if *checker != config.health_checker {
            info!(
                cluster = %self.name,
                from = ?*checker,
                to = ?config.health_checker,
                "cluster health checker changed"
            );
            *checker = config.health_checker.clone();
        }
        *self.site_group.write() = config.site_group.clone();
    }

    /// All instances of both planes.
    pub fn all_ips(&self) -> Vec<Instance> {
        let mut result: Vec<Instance> = self.ephemeral.read().values().cloned().collect();
        result.extend(self.persistent.read().values().cloned());
        result
    }

    /// All instances of one plane.
    pub fn all_ips_plane(&self, ephemeral: bool) -> Vec<Instance> {
        let plane = if ephemeral { &self.ephemeral } else { &self.persistent };
        plane.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ephemeral.read().is_empty() && self.persistent.read().is_empty()
    }

    /// Install a new instance set on one plane. Addresses already present
    /// on the other plane are skipped: an address belongs to exactly one
    /// plane within a cluster.
    pub fn update_ips(&self, ips: Vec<Instance>, ephemeral: bool) {
        let mut incoming: HashMap<String, Instance> = HashMap::with_capacity(ips.len());
        {
            let other = if ephemeral { self.persistent.read() } else { self.ephemeral.read() };
            for instance in ips {
                let addr = instance.ip_addr();
                if other.contains_key(&addr) {
                    warn!(
                        cluster = %self.name,
                        %addr,
                        ephemeral,
                        "address already registered on the other plane, skipping"
                    );
                    continue;
                }
                incoming.insert(addr, instance);
            }
        }

        let plane = if ephemeral { &self.ephemeral } else { &self.persistent };
        let mut current = plane.write();

        let added = incoming.keys().filter(|k| !current.contains_key(*k)).count();
        let removed = current.keys().filter(|k| !incoming.contains_key(*k)).count();
        if added > 0 || removed > 0 {
            info!(
                cluster = %self.name,
                ephemeral,
                added,
                removed,
                total = incoming.len(),
                "instance set updated"
            );
        } else {
            debug!(cluster = %self.name, ephemeral, total = incoming.len(), "instance set refreshed");
        }

        *current = incoming;
    }

    /// Look up an instance by `ip:port` on either plane.
    pub fn find(&self, ip_addr: &str) -> Option<Instance> {
        self.ephemeral
            .read()
            .get(ip_addr)
            .cloned()
            .or_else(|| self.persistent.read().get(ip_addr).cloned())
    }

    /// Overwrite the health flag of the instance at `ip_addr` on whichever
    /// plane holds it. Returns true when a flag actually flipped.
    pub fn set_healthy(&self, ip_addr: &str, healthy: bool) -> bool {
        let mut changed = false;
        for plane in [&self.ephemeral, &self.persistent] {
            if let Some(instance) = plane.write().get_mut(ip_addr) {
                if instance.healthy != healthy {
                    instance.healthy = healthy;
                    changed = true;
                    info!(
                        cluster = %self.name,
                        %ip_addr,
                        healthy,
                        "instance health overwritten"
                    );
                }
            }
        }
        changed
    }

    pub fn validate(&self) -> NamingResult<()> {
        if !cluster_name_pattern().is_match(&self.name) {
            return Err(NamingError::InvalidArgument(format!(
                "cluster name can only contain 0-9a-zA-Z-, got: {}",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(ip: &str, port: u16, ephemeral: bool) -> Instance {
        let mut instance = Instance::new(ip, port);
        instance.ephemeral = ephemeral;
        instance
    }

    #[test]
    fn planes_are_disjoint() {
        let cluster = Cluster::new("DEFAULT");
        cluster.update_ips(vec![instance("10.0.0.1", 80, true)], true);
        cluster.update_ips(vec![instance("10.0.0.2", 80, false)], false);

        assert_eq!(cluster.all_ips_plane(true).len(), 1);
        assert_eq!(cluster.all_ips_plane(false).len(), 1);
        assert_eq!(cluster.all_ips().len(), 2);
    }

    #[test]
    fn cross_plane_duplicate_is_skipped() {
        let cluster = Cluster::new("DEFAULT");
        cluster.update_ips(vec![instance("10.0.0.1", 80, true)], true);
        cluster.update_ips(vec![instance("10.0.0.1", 80, false)], false);

        assert_eq!(cluster.all_ips_plane(false).len(), 0);
        assert_eq!(cluster.all_ips().len(), 1);
    }

    #[test]
    fn update_replaces_the_plane() {
        let cluster = Cluster::new("DEFAULT");
        cluster.update_ips(
            vec![instance("10.0.0.1", 80, true), instance("10.0.0.2", 80, true)],
            true,
        );
        cluster.update_ips(vec![instance("10.0.0.3", 80, true)], true);

        let ips = cluster.all_ips_plane(true);
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].ip, "10.0.0.3");
    }

    #[test]
    fn duplicate_address_collapses_within_plane() {
        let cluster = Cluster::new("DEFAULT");
        cluster.update_ips(
            vec![instance("10.0.0.1", 80, true), instance("10.0.0.1", 80, true)],
            true,
        );
        assert_eq!(cluster.all_ips_plane(true).len(), 1);
    }

    #[test]
    fn set_healthy_reports_changes() {
        let cluster = Cluster::new("DEFAULT");
        cluster.update_ips(vec![instance("10.0.0.1", 80, true)], true);

        assert!(cluster.set_healthy("10.0.0.1:80", false));
        assert!(!cluster.set_healthy("10.0.0.1:80", false));
        assert!(!cluster.find("10.0.0.1:80").unwrap().healthy);
        assert!(!cluster.set_healthy("10.9.9.9:80", false));
    }

    #[test]
    fn validate_checks_name_syntax() {
        assert!(Cluster::new("edge-1").validate().is_ok());
        assert!(Cluster::new("bad name").validate().is_err());
        assert!(Cluster::new("").validate().is_err());
    }

    #[test]
    fn config_round_trip() {
        let config = ClusterConfig {
            name: "edge".to_string(),
            health_checker: HealthCheckerConfig {
                kind: CheckerKind::Http,
                check_port: 8080,
                use_instance_port: false,
            },
            site_group: "dc1".to_string(),
        };
        let cluster = Cluster::from_config(&config);
        assert_eq!(cluster.config(), config);
    }
}
