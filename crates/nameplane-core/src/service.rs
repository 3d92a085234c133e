//! Service — the aggregate root for one `group::name` within a namespace.
//!
//! A service owns its clusters, reacts to instance-list change events
//! delivered by the consistency layer, and maintains the MD5 checksum that
//! peers compare during anti-entropy.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, ClusterConfig};
use crate::consistency::keys;
use crate::consistency::{Record, RecordListener};
use crate::contracts::{BeatCheckTask, ClientBeat, ClusterCheckKey, HealthScheduler, PushSink};
use crate::error::{NamingError, NamingResult};
use crate::instance::{Instance, DEFAULT_CLUSTER_NAME};

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Group prepended to bare service names.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Separator between group and name in the canonical service name.
pub const GROUP_CONNECTOR: &str = "::";

/// Instances are removed when they have not sent a beat for this long.
pub const DEFAULT_IP_DELETE_TIMEOUT_MS: u64 = 30_000;

fn service_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9a-zA-Z@.:_-]+$").expect("valid pattern"))
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Canonicalize a service name to `group::name`.
pub fn grouped_name(name: &str) -> String {
    if name.contains(GROUP_CONNECTOR) {
        name.to_string()
    } else {
        format!("{DEFAULT_GROUP}{GROUP_CONNECTOR}{name}")
    }
}

/// Group portion of a canonical service name.
pub fn group_of(name: &str) -> &str {
    name.split_once(GROUP_CONNECTOR).map(|(g, _)| g).unwrap_or(DEFAULT_GROUP)
}

/// Namespace fallback for values arriving with an empty namespace.
pub fn normalize_namespace(namespace_id: &str) -> &str {
    if namespace_id.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace_id
    }
}

pub fn validate_service_name(name: &str) -> NamingResult<()> {
    if !service_name_pattern().is_match(name) {
        return Err(NamingError::InvalidArgument(format!(
            "service name can only contain 0-9a-zA-Z@.:_-, got: {name}"
        )));
    }
    Ok(())
}

/// Opaque client-side instance filter, carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Selector {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl Default for Selector {
    fn default() -> Self {
        Self { kind: "none".to_string(), expression: None }
    }
}

/// Serializable form of a service, the value stored under meta keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSnapshot {
    pub namespace_id: String,
    pub name: String,
    pub group_name: String,
    pub protect_threshold: f64,
    pub metadata: HashMap<String, String>,
    pub selector: Selector,
    pub enabled: bool,
    pub reset_weight: bool,
    pub token: String,
    pub owners: Vec<String>,
    pub ip_delete_timeout_ms: u64,
    pub last_modified_millis: i64,
    pub clusters: Vec<ClusterConfig>,
}

/// Mutable top-level fields, updated wholesale from snapshots.
#[derive(Debug, Clone, Default)]
struct ServiceMeta {
    token: String,
    owners: Vec<String>,
    protect_threshold: f64,
    reset_weight: bool,
    enabled: bool,
    selector: Selector,
    metadata: HashMap<String, String>,
}

/// Canonical header serialized into the checksum input.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumHeader {
    name: String,
    ip_count: usize,
    invalid_ip_count: usize,
    owners: Vec<String>,
    token: String,
    protect_threshold: f64,
    clusters: Vec<ClusterConfig>,
}

/// Aggregate root for one named service.
pub struct Service {
    namespace_id: String,
    name: String,
    group_name: String,
    meta: RwLock<ServiceMeta>,
    clusters: RwLock<BTreeMap<String, Arc<Cluster>>>,
    last_modified_millis: AtomicI64,
    checksum: RwLock<String>,
    finalize_count: AtomicU32,
    ip_delete_timeout_ms: AtomicU64,
    /// Serializes add/remove mutations; held across the consistency write.
    update_guard: tokio::sync::Mutex<()>,
    push: Arc<dyn PushSink>,
    health: Arc<dyn HealthScheduler>,
}

impl Service {
    pub fn new(
        namespace_id: &str,
        name: &str,
        push: Arc<dyn PushSink>,
        health: Arc<dyn HealthScheduler>,
    ) -> Self {
        let name = grouped_name(name);
        let group_name = group_of(&name).to_string();
        Self {
            namespace_id: normalize_namespace(namespace_id).to_string(),
            name,
            group_name,
            meta: RwLock::new(ServiceMeta {
                enabled: true,
                ..Default::default()
            }),
            clusters: RwLock::new(BTreeMap::new()),
            last_modified_millis: AtomicI64::new(epoch_millis()),
            checksum: RwLock::new(String::new()),
            finalize_count: AtomicU32::new(0),
            ip_delete_timeout_ms: AtomicU64::new(DEFAULT_IP_DELETE_TIMEOUT_MS),
            update_guard: tokio::sync::Mutex::new(()),
            push,
            health,
        }
    }

    /// Rebuild a service from its serialized form.
    pub fn from_snapshot(
        snapshot: &ServiceSnapshot,
        push: Arc<dyn PushSink>,
        health: Arc<dyn HealthScheduler>,
    ) -> Self {
        let service = Self::new(&snapshot.namespace_id, &snapshot.name, push, health);
        {
            let mut meta = service.meta.write();
            meta.token = snapshot.token.clone();
            meta.owners = snapshot.owners.clone();
            meta.protect_threshold = snapshot.protect_threshold;
            meta.reset_weight = snapshot.reset_weight;
            meta.enabled = snapshot.enabled;
            meta.selector = snapshot.selector.clone();
            meta.metadata = snapshot.metadata.clone();
        }
        if snapshot.ip_delete_timeout_ms > 0 {
            service
                .ip_delete_timeout_ms
                .store(snapshot.ip_delete_timeout_ms, Ordering::Relaxed);
        }
        if snapshot.last_modified_millis > 0 {
            service
                .last_modified_millis
                .store(snapshot.last_modified_millis, Ordering::Relaxed);
        }
        {
            let mut clusters = service.clusters.write();
            for config in &snapshot.clusters {
                clusters.insert(config.name.clone(), Arc::new(Cluster::from_config(config)));
            }
        }
        service.recalculate_checksum();
        service
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let meta = self.meta.read();
        ServiceSnapshot {
            namespace_id: self.namespace_id.clone(),
            name: self.name.clone(),
            group_name: self.group_name.clone(),
            protect_threshold: meta.protect_threshold,
            metadata: meta.metadata.clone(),
            selector: meta.selector.clone(),
            enabled: meta.enabled,
            reset_weight: meta.reset_weight,
            token: meta.token.clone(),
            owners: meta.owners.clone(),
            ip_delete_timeout_ms: self.ip_delete_timeout_ms.load(Ordering::Relaxed),
            last_modified_millis: self.last_modified_millis.load(Ordering::Relaxed),
            clusters: self.clusters.read().values().map(|c| c.config()).collect(),
        }
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn enabled(&self) -> bool {
        self.meta.read().enabled
    }

    pub fn protect_threshold(&self) -> f64 {
        self.meta.read().protect_threshold
    }

    pub fn owners(&self) -> Vec<String> {
        self.meta.read().owners.clone()
    }

    pub fn ip_delete_timeout_ms(&self) -> u64 {
        self.ip_delete_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn last_modified_millis(&self) -> i64 {
        self.last_modified_millis.load(Ordering::Relaxed)
    }

    pub fn finalize_count(&self) -> u32 {
        self.finalize_count.load(Ordering::Relaxed)
    }

    pub fn set_finalize_count(&self, count: u32) {
        self.finalize_count.store(count, Ordering::Relaxed);
    }

    /// Mutation boundary: add/remove hold this across the consistency write
    /// so per-service instance-list writes stay ordered.
    pub async fn lock_updates(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.update_guard.lock().await
    }

    /// Current checksum, computing it first if none has been computed yet.
    pub fn checksum(&self) -> String {
        if self.checksum.read().is_empty() {
            self.recalculate_checksum();
        }
        self.checksum.read().clone()
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Fetch or lazily create a cluster, scheduling its persistent health
    /// check on creation.
    pub fn ensure_cluster(&self, name: &str) -> Arc<Cluster> {
        if let Some(cluster) = self.clusters.read().get(name) {
            return Arc::clone(cluster);
        }
        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(name) {
            return Arc::clone(cluster);
        }
        warn!(
            service = %self.name,
            cluster = %name,
            "cluster not found, creating with default configuration"
        );
        let cluster = Arc::new(Cluster::new(name));
        clusters.insert(name.to_string(), Arc::clone(&cluster));
        self.health.schedule_cluster_check(
            ClusterCheckKey {
                namespace_id: self.namespace_id.clone(),
                service_name: self.name.clone(),
                cluster_name: name.to_string(),
            },
            cluster.config().health_checker,
        );
        cluster
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.read().values().all(|c| c.is_empty())
    }

    /// All instances across clusters and planes.
    pub fn all_ips(&self) -> Vec<Instance> {
        let clusters = self.clusters.read();
        clusters.values().flat_map(|c| c.all_ips()).collect()
    }

    /// All instances of one plane.
    pub fn all_ips_plane(&self, ephemeral: bool) -> Vec<Instance> {
        let clusters = self.clusters.read();
        clusters.values().flat_map(|c| c.all_ips_plane(ephemeral)).collect()
    }

    /// All instances of the named clusters; unknown names are skipped.
    pub fn all_ips_in_clusters(&self, cluster_names: &[String]) -> Vec<Instance> {
        let clusters = self.clusters.read();
        cluster_names
            .iter()
            .filter_map(|name| clusters.get(name))
            .flat_map(|c| c.all_ips())
            .collect()
    }

    /// Instances of the named clusters, or of every cluster when the list
    /// is empty.
    pub fn srv_ips(&self, cluster_names: &[String]) -> Vec<Instance> {
        if cluster_names.is_empty() {
            self.all_ips()
        } else {
            self.all_ips_in_clusters(cluster_names)
        }
    }

    /// Look up one instance by `ip:port` across all clusters.
    pub fn find_instance(&self, ip_addr: &str) -> Option<Instance> {
        let clusters = self.clusters.read();
        clusters.values().find_map(|c| c.find(ip_addr))
    }

    pub fn healthy_instance_count(&self) -> usize {
        self.all_ips().iter().filter(|i| i.healthy).count()
    }

    /// Protection flag: healthy share has fallen to or below the protect
    /// threshold, so consumers should treat the unhealthy set as serving.
    pub fn trigger_flag(&self) -> bool {
        let total = self.all_ips().len();
        if total == 0 {
            return false;
        }
        let healthy = self.healthy_instance_count();
        (healthy as f64 / total as f64) <= self.protect_threshold()
    }

    /// Apply an instance-list change event: clamp weights, install the new
    /// list, recompute the checksum, notify the push layer.
    pub fn apply_instances(&self, key: &str, mut instances: Vec<Instance>) -> NamingResult<()> {
        for instance in &mut instances {
            if instance.ip.is_empty() {
                return Err(NamingError::Fatal(format!(
                    "instance list for {key} contains an entry without an address"
                )));
            }
            instance.clamp_weight();
        }

        self.update_ips(instances, keys::match_ephemeral_instance_list_key(key));
        self.recalculate_checksum();
        self.push.service_changed(self);
        Ok(())
    }

    /// Partition instances by cluster (creating missing clusters) and
    /// install each partition on the given plane. Clusters not mentioned
    /// have that plane emptied.
    pub fn update_ips(&self, instances: Vec<Instance>, ephemeral: bool) {
        let mut by_cluster: HashMap<String, Vec<Instance>> =
            self.cluster_names().into_iter().map(|name| (name, Vec::new())).collect();

        for mut instance in instances {
            if instance.cluster_name.is_empty() {
                instance.cluster_name = DEFAULT_CLUSTER_NAME.to_string();
            }
            let cluster_name = instance.cluster_name.clone();
            if !by_cluster.contains_key(&cluster_name) {
                self.ensure_cluster(&cluster_name);
            }
            by_cluster.entry(cluster_name).or_default().push(instance);
        }

        for (cluster_name, ips) in by_cluster {
            if let Some(cluster) = self.cluster(&cluster_name) {
                cluster.update_ips(ips, ephemeral);
            }
        }

        self.last_modified_millis.store(epoch_millis(), Ordering::Relaxed);

        if tracing::enabled!(tracing::Level::DEBUG) {
            let joined: String = self
                .all_ips()
                .iter()
                .map(|i| format!("{}_{},", i.ip_addr(), i.healthy))
                .collect();
            debug!(
                namespace = %self.namespace_id,
                service = %self.name,
                ips = %joined,
                "instance list updated"
            );
        }
    }

    /// Overwrite local health flags from a peer snapshot keyed by `ip:port`.
    /// Addresses absent from the snapshot count as unhealthy upstream.
    /// Returns true when any flag flipped.
    pub fn apply_remote_health(&self, statuses: &HashMap<String, bool>) -> bool {
        let clusters: Vec<Arc<Cluster>> = self.clusters.read().values().cloned().collect();
        let mut changed = false;
        for cluster in clusters {
            for instance in cluster.all_ips() {
                let addr = instance.ip_addr();
                let remote = statuses.get(&addr).copied().unwrap_or(false);
                if cluster.set_healthy(&addr, remote) {
                    changed = true;
                }
            }
        }
        changed
    }

    /// Adopt top-level fields and cluster definitions from a newer
    /// snapshot: matching clusters update in place, new ones are added,
    /// missing ones are destroyed.
    pub fn update(&self, other: &ServiceSnapshot) {
        {
            let mut meta = self.meta.write();
            if meta.token != other.token {
                info!(service = %self.name, from = %meta.token, to = %other.token, "token changed");
                meta.token = other.token.clone();
            }
            if meta.owners != other.owners {
                info!(service = %self.name, owners = ?other.owners, "owners changed");
                meta.owners = other.owners.clone();
            }
            if meta.protect_threshold != other.protect_threshold {
                info!(
                    service = %self.name,
                    from = meta.protect_threshold,
                    to = other.protect_threshold,
                    "protect threshold changed"
                );
                meta.protect_threshold = other.protect_threshold;
            }
            if meta.reset_weight != other.reset_weight {
                info!(service = %self.name, reset_weight = other.reset_weight, "reset-weight changed");
                meta.reset_weight = other.reset_weight;
            }
            if meta.enabled != other.enabled {
                info!(service = %self.name, enabled = other.enabled, "enabled changed");
                meta.enabled = other.enabled;
            }
            meta.selector = other.selector.clone();
            meta.metadata = other.metadata.clone();
        }

        self.update_or_add_clusters(&other.clusters);
        self.remove_dead_clusters(&other.clusters);
        self.recalculate_checksum();
    }

    /// Add or update one cluster definition.
    pub fn add_cluster(&self, config: &ClusterConfig) {
        self.update_or_add_clusters(std::slice::from_ref(config));
    }

    fn update_or_add_clusters(&self, incoming: &[ClusterConfig]) {
        for config in incoming {
            let existing = self.clusters.read().get(&config.name).cloned();
            match existing {
                Some(cluster) => cluster.update_config(config),
                None => {
                    let cluster = Arc::new(Cluster::from_config(config));
                    self.clusters.write().insert(config.name.clone(), Arc::clone(&cluster));
                    self.health.schedule_cluster_check(
                        ClusterCheckKey {
                            namespace_id: self.namespace_id.clone(),
                            service_name: self.name.clone(),
                            cluster_name: config.name.clone(),
                        },
                        config.health_checker.clone(),
                    );
                }
            }
        }
    }

    fn remove_dead_clusters(&self, incoming: &[ClusterConfig]) {
        let dead: Vec<String> = {
            let clusters = self.clusters.read();
            clusters
                .keys()
                .filter(|name| !incoming.iter().any(|c| &&c.name == name))
                .cloned()
                .collect()
        };
        for name in dead {
            self.clusters.write().remove(&name);
            self.health.cancel_cluster_check(&ClusterCheckKey {
                namespace_id: self.namespace_id.clone(),
                service_name: self.name.clone(),
                cluster_name: name.clone(),
            });
            info!(service = %self.name, cluster = %name, "cluster removed");
        }
    }

    /// Canonical header JSON; clusters sorted by name so all peers derive
    /// the same bytes from the same content.
    pub fn service_string(&self) -> String {
        let ips = self.all_ips();
        let meta = self.meta.read();
        let header = ChecksumHeader {
            name: self.name.clone(),
            ip_count: ips.len(),
            invalid_ip_count: ips.iter().filter(|i| !i.healthy).count(),
            owners: meta.owners.clone(),
            token: meta.token.clone(),
            protect_threshold: meta.protect_threshold,
            clusters: self.clusters.read().values().map(|c| c.config()).collect(),
        };
        match serde_json::to_string(&header) {
            Ok(json) => json,
            Err(e) => {
                error!(service = %self.name, error = %e, "failed to serialize checksum header");
                String::new()
            }
        }
    }

    /// Recompute the MD5 checksum over the canonical serialization: header
    /// plus the instance list sorted by encoded form.
    pub fn recalculate_checksum(&self) {
        let mut slot = self.checksum.write();

        let mut input = self.service_string();
        let mut ips = self.all_ips();
        ips.sort_by_key(|i| i.encode());
        for ip in &ips {
            input.push_str(&ip.checksum_entry());
            input.push(',');
        }

        *slot = format!("{:x}", md5::compute(input.as_bytes()));
    }

    /// Hand an inbound heartbeat to the health scheduler.
    pub fn process_client_beat(self: &Arc<Self>, beat: ClientBeat) {
        self.health.schedule_now(Arc::clone(self), beat);
    }

    /// Register the heartbeat sweeper and per-cluster health checks.
    pub fn init(self: &Arc<Self>) {
        self.health.schedule_check(BeatCheckTask {
            namespace_id: self.namespace_id.clone(),
            service_name: self.name.clone(),
        });
        for name in self.cluster_names() {
            if let Some(cluster) = self.cluster(&name) {
                self.health.schedule_cluster_check(
                    ClusterCheckKey {
                        namespace_id: self.namespace_id.clone(),
                        service_name: self.name.clone(),
                        cluster_name: name,
                    },
                    cluster.config().health_checker,
                );
            }
        }
    }

    /// Cancel every scheduled check for this service.
    pub fn destroy(&self) {
        for name in self.cluster_names() {
            self.health.cancel_cluster_check(&ClusterCheckKey {
                namespace_id: self.namespace_id.clone(),
                service_name: self.name.clone(),
                cluster_name: name,
            });
        }
        self.health.cancel_check(&BeatCheckTask {
            namespace_id: self.namespace_id.clone(),
            service_name: self.name.clone(),
        });
    }

    pub fn validate(&self) -> NamingResult<()> {
        validate_service_name(&self.name)?;
        let clusters: Vec<Arc<Cluster>> = self.clusters.read().values().cloned().collect();
        for cluster in clusters {
            cluster.validate()?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordListener for Service {
    fn interests(&self, key: &str) -> bool {
        keys::match_instance_list_key(key, &self.namespace_id, &self.name)
    }

    fn match_unlisten_key(&self, key: &str) -> bool {
        keys::match_instance_list_key(key, &self.namespace_id, &self.name)
    }

    async fn on_change(&self, key: &str, value: Record) -> NamingResult<()> {
        match value {
            Record::Instances(instances) => {
                debug!(%key, count = instances.instance_list.len(), "instance list changed");
                self.apply_instances(key, instances.instance_list)
            }
            Record::Metadata(_) => {
                warn!(%key, "unexpected metadata record on an instance-list key");
                Ok(())
            }
        }
    }

    async fn on_delete(&self, _key: &str) -> NamingResult<()> {
        Ok(())
    }
}
