//! Service registry — the namespaced two-level service table.
//!
//! All client-facing registration traffic lands here. Writes never mutate
//! the table in place: the registry computes the merged instance list and
//! writes it through the consistency layer; the change event that fires
//! back is what updates the owning service (possibly on another peer).
//!
//! The registry is also the listener for service-meta keys: snapshots
//! arriving from peers create or update local services, and meta-key
//! deletes tear them down.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{error, info, warn};

use nameplane_core::consistency::keys;
use nameplane_core::consistency::{ConsistencyService, Instances, Record, RecordListener};
use nameplane_core::service::{grouped_name, normalize_namespace, validate_service_name, GROUP_CONNECTOR};
use nameplane_core::{
    ClusterConfig, HealthScheduler, Instance, NamingError, NamingResult, PushSink, Service,
    ServiceSnapshot, Switches,
};
use nameplane_distro::DistroRouter;

use crate::merge::{merge, MergeAction};

type ServiceMap = Arc<DashMap<String, Arc<Service>>>;

/// Core table of all services, keyed namespace → `group::name`.
pub struct ServiceRegistry {
    table: DashMap<String, ServiceMap>,
    consistency: Arc<dyn ConsistencyService>,
    push: Arc<dyn PushSink>,
    health: Arc<dyn HealthScheduler>,
    switches: Arc<Switches>,
    /// Guards first-time namespace insertion.
    put_service_lock: Mutex<()>,
}

impl ServiceRegistry {
    pub fn new(
        consistency: Arc<dyn ConsistencyService>,
        push: Arc<dyn PushSink>,
        health: Arc<dyn HealthScheduler>,
        switches: Arc<Switches>,
    ) -> Self {
        Self {
            table: DashMap::new(),
            consistency,
            push,
            health,
            switches,
            put_service_lock: Mutex::new(()),
        }
    }

    /// Subscribe to service-meta changes. Call once at startup, before
    /// the transport starts.
    pub async fn start(self: &Arc<Self>) -> NamingResult<()> {
        info!("listening for service meta changes");
        let listener: Arc<dyn RecordListener> = Arc::clone(self) as Arc<dyn RecordListener>;
        self.consistency
            .listen(keys::SERVICE_META_KEY_PREFIX, listener)
            .await
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_service(&self, namespace_id: &str, service_name: &str) -> Option<Arc<Service>> {
        let name = grouped_name(service_name);
        self.table.get(namespace_id)?.get(&name).map(|s| Arc::clone(&s))
    }

    pub fn contains_service(&self, namespace_id: &str, service_name: &str) -> bool {
        self.get_service(namespace_id, service_name).is_some()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.table.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all_service_names(&self, namespace_id: &str) -> Vec<String> {
        match self.table.get(namespace_id) {
            Some(inner) => inner.iter().map(|e| e.key().clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Every namespace with its service names.
    pub fn all_service_names_map(&self) -> HashMap<String, Vec<String>> {
        self.table
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().map(|s| s.key().clone()).collect()))
            .collect()
    }

    pub fn service_count(&self) -> usize {
        self.table.iter().map(|e| e.value().len()).sum()
    }

    pub fn instance_count(&self) -> usize {
        self.table
            .iter()
            .map(|e| e.value().iter().map(|s| s.value().all_ips().len()).sum::<usize>())
            .sum()
    }

    /// Count of services this peer is responsible for.
    pub fn responsible_service_count(&self, router: &DistroRouter) -> usize {
        self.table
            .iter()
            .map(|e| e.value().iter().filter(|s| router.responsible(s.key())).count())
            .sum()
    }

    pub fn responsible_instance_count(&self, router: &DistroRouter) -> usize {
        self.table
            .iter()
            .map(|e| {
                e.value()
                    .iter()
                    .filter(|s| router.responsible(s.key()))
                    .map(|s| s.value().all_ips().len())
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn get_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        cluster: &str,
        ip: &str,
        port: u16,
    ) -> Option<Instance> {
        let service = self.get_service(namespace_id, service_name)?;
        service
            .all_ips_in_clusters(&[cluster.to_string()])
            .into_iter()
            .find(|i| i.ip == ip && i.port == port)
    }

    /// Services whose `name:owners` key fully matches `pattern`.
    pub fn search_services(
        &self,
        namespace_id: &str,
        pattern: &str,
    ) -> NamingResult<Vec<Arc<Service>>> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| NamingError::InvalidArgument(format!("bad search pattern: {e}")))?;

        let Some(inner) = self.table.get(namespace_id) else {
            return Ok(Vec::new());
        };
        let services: Vec<Arc<Service>> = inner.iter().map(|e| Arc::clone(e.value())).collect();
        drop(inner);

        Ok(services
            .into_iter()
            .filter(|s| {
                let key = format!("{}:{}", s.name(), s.owners().join(","));
                regex.is_match(&key)
            })
            .collect())
    }

    /// Offset-paged service listing.
    ///
    /// `param` is expanded into `*p1*::*p2*` wildcard patterns (omitted
    /// parts become `*`). `contained_instance` filters by exact `ip:port`
    /// when it contains a colon, by ip substring otherwise.
    /// `has_ip_count` drops services with zero instances. Returns the
    /// total match count and the requested page, sorted by name.
    pub fn paged_services(
        &self,
        namespace_id: &str,
        start_page: usize,
        page_size: usize,
        param: &str,
        contained_instance: Option<&str>,
        has_ip_count: bool,
    ) -> NamingResult<(usize, Vec<Arc<Service>>)> {
        let Some(inner) = self.table.get(namespace_id) else {
            return Ok((0, Vec::new()));
        };
        let all: Vec<Arc<Service>> = inner.iter().map(|e| Arc::clone(e.value())).collect();
        drop(inner);

        let mut matched = if param.trim().is_empty() {
            all
        } else {
            let pattern = param
                .split(GROUP_CONNECTOR)
                .map(|part| {
                    if part.trim().is_empty() {
                        ".*".to_string()
                    } else {
                        format!(".*{}.*", regex::escape(part))
                    }
                })
                .collect::<Vec<_>>()
                .join(GROUP_CONNECTOR);
            self.search_services(namespace_id, &pattern)?
        };

        if has_ip_count {
            matched.retain(|s| !s.all_ips().is_empty());
        }

        if let Some(contained) = contained_instance.filter(|c| !c.is_empty()) {
            matched.retain(|s| {
                s.all_ips().iter().any(|i| {
                    if contained.contains(':') {
                        i.ip_addr() == contained
                    } else {
                        i.ip.contains(contained)
                    }
                })
            });
        }

        matched.sort_by(|a, b| a.name().cmp(b.name()));
        let total = matched.len();

        if page_size >= total {
            return Ok((total, matched));
        }
        let page = matched
            .into_iter()
            .skip(start_page * page_size)
            .take(page_size)
            .collect();
        Ok((total, page))
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create the service if it does not exist yet; persistent services
    /// are additionally written through the consistency layer so peers
    /// observe them.
    pub async fn create_service_if_absent(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        cluster: Option<ClusterConfig>,
    ) -> NamingResult<()> {
        let name = grouped_name(service_name);
        if self.get_service(namespace_id, &name).is_some() {
            return Ok(());
        }

        info!(namespace = %namespace_id, service = %name, "creating empty service");
        let service = Service::new(
            namespace_id,
            &name,
            Arc::clone(&self.push),
            Arc::clone(&self.health),
        );
        if let Some(cluster) = cluster {
            service.add_cluster(&cluster);
        }
        service.recalculate_checksum();
        service.validate()?;

        let service = Arc::new(service);
        self.put_service_and_init(Arc::clone(&service)).await?;

        if !ephemeral {
            self.consistency
                .put(
                    &keys::build_service_meta_key(service.namespace_id(), service.name()),
                    Record::Metadata(service.snapshot()),
                )
                .await?;
        }
        Ok(())
    }

    /// Register an instance, creating service and cluster silently when
    /// they do not exist.
    pub async fn register_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        instance: Instance,
    ) -> NamingResult<()> {
        instance.validate()?;
        self.create_service_if_absent(namespace_id, service_name, instance.ephemeral, None)
            .await?;

        if !self.contains_service(namespace_id, service_name) {
            return Err(NamingError::NotFound(format!(
                "service not found: {namespace_id}/{service_name}"
            )));
        }
        let ephemeral = instance.ephemeral;
        self.add_instances(namespace_id, service_name, ephemeral, vec![instance])
            .await
    }

    /// Update a registered instance. The instance must already exist.
    pub async fn update_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        instance: Instance,
    ) -> NamingResult<()> {
        let service = self.require_service(namespace_id, service_name)?;
        if !service.all_ips().iter().any(|i| i == &instance) {
            return Err(NamingError::InvalidArgument(format!(
                "instance not exist: {}",
                instance.ip_addr()
            )));
        }
        instance.validate()?;
        let ephemeral = instance.ephemeral;
        self.add_instances(namespace_id, service_name, ephemeral, vec![instance])
            .await
    }

    /// Deregister an instance. A no-op write when the instance is already
    /// absent, which keeps peers' last-modified fresh.
    pub async fn deregister_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        instance: Instance,
    ) -> NamingResult<()> {
        self.require_service(namespace_id, service_name)?;
        let ephemeral = instance.ephemeral;
        self.remove_instances(namespace_id, service_name, ephemeral, vec![instance])
            .await
    }

    /// Merge the given instances into one plane and write the new list.
    pub async fn add_instances(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        ips: Vec<Instance>,
    ) -> NamingResult<()> {
        self.apply_instances(namespace_id, service_name, ephemeral, MergeAction::Add, ips)
            .await
    }

    /// Remove the given instances from one plane and write the new list.
    pub async fn remove_instances(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        ips: Vec<Instance>,
    ) -> NamingResult<()> {
        self.apply_instances(namespace_id, service_name, ephemeral, MergeAction::Remove, ips)
            .await
    }

    async fn apply_instances(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        action: MergeAction,
        ips: Vec<Instance>,
    ) -> NamingResult<()> {
        let service = self.require_service(namespace_id, service_name)?;
        let key = keys::build_instance_list_key(service.namespace_id(), service.name(), ephemeral);

        let _guard = service.lock_updates().await;
        let instance_list = merge(
            self.consistency.as_ref(),
            &self.switches,
            &service,
            action,
            ephemeral,
            ips,
        )
        .await?;
        self.consistency
            .put(&key, Record::Instances(Instances { instance_list }))
            .await
    }

    /// Store the service, start its checks, and register it as listener
    /// for both of its instance-list keys. Idempotent.
    pub async fn put_service_and_init(&self, service: Arc<Service>) -> NamingResult<()> {
        {
            let _guard = self.put_service_lock.lock();
            self.table
                .entry(service.namespace_id().to_string())
                .or_insert_with(|| Arc::new(DashMap::new()));
        }
        if let Some(inner) = self.table.get(service.namespace_id()) {
            inner.insert(service.name().to_string(), Arc::clone(&service));
        }
        service.init();

        let listener: Arc<dyn RecordListener> = Arc::clone(&service) as Arc<dyn RecordListener>;
        self.consistency
            .listen(
                &keys::build_instance_list_key(service.namespace_id(), service.name(), true),
                Arc::clone(&listener),
            )
            .await?;
        self.consistency
            .listen(
                &keys::build_instance_list_key(service.namespace_id(), service.name(), false),
                listener,
            )
            .await?;
        info!(namespace = %service.namespace_id(), service = %service.name(), "new service stored");
        Ok(())
    }

    /// Replace the service's meta record, propagating to peers.
    pub async fn add_or_replace_service(&self, snapshot: ServiceSnapshot) -> NamingResult<()> {
        let key = keys::build_service_meta_key(
            normalize_namespace(&snapshot.namespace_id),
            &snapshot.name,
        );
        self.consistency.put(&key, Record::Metadata(snapshot)).await
    }

    /// Remove a service by deleting its meta key; teardown happens when
    /// the delete event fires back.
    pub async fn easy_remove_service(
        &self,
        namespace_id: &str,
        service_name: &str,
    ) -> NamingResult<()> {
        let service = self.require_service(namespace_id, service_name)?;
        self.consistency
            .remove(&keys::build_service_meta_key(service.namespace_id(), service.name()))
            .await
    }

    fn require_service(
        &self,
        namespace_id: &str,
        service_name: &str,
    ) -> NamingResult<Arc<Service>> {
        self.get_service(namespace_id, service_name).ok_or_else(|| {
            NamingError::NotFound(format!("service not found: {namespace_id}/{service_name}"))
        })
    }
}

#[async_trait]
impl RecordListener for ServiceRegistry {
    fn interests(&self, key: &str) -> bool {
        keys::match_service_meta_key(key) && !keys::match_switch_key(key)
    }

    fn match_unlisten_key(&self, key: &str) -> bool {
        keys::match_service_meta_key(key) && !keys::match_switch_key(key)
    }

    async fn on_change(&self, key: &str, value: Record) -> NamingResult<()> {
        let Record::Metadata(mut snapshot) = value else {
            warn!(%key, "unexpected instance-list record on a meta key");
            return Ok(());
        };
        snapshot.namespace_id = normalize_namespace(&snapshot.namespace_id).to_string();
        snapshot.name = grouped_name(&snapshot.name);
        validate_service_name(&snapshot.name)?;

        match self.get_service(&snapshot.namespace_id, &snapshot.name) {
            Some(existing) => {
                existing.update(&snapshot);
                // Re-listen to recover from an accidental unlisten.
                let listener: Arc<dyn RecordListener> = Arc::clone(&existing) as Arc<dyn RecordListener>;
                self.consistency
                    .listen(
                        &keys::build_instance_list_key(&snapshot.namespace_id, &snapshot.name, true),
                        Arc::clone(&listener),
                    )
                    .await?;
                self.consistency
                    .listen(
                        &keys::build_instance_list_key(&snapshot.namespace_id, &snapshot.name, false),
                        listener,
                    )
                    .await?;
            }
            None => {
                let service = Arc::new(Service::from_snapshot(
                    &snapshot,
                    Arc::clone(&self.push),
                    Arc::clone(&self.health),
                ));
                service.validate()?;
                self.put_service_and_init(service).await?;
            }
        }
        Ok(())
    }

    async fn on_delete(&self, key: &str) -> NamingResult<()> {
        let Some((namespace, name)) = keys::parse_key(key) else {
            warn!(%key, "delete event for unparseable key");
            return Ok(());
        };

        if let Some(service) = self.get_service(&namespace, &name) {
            service.destroy();
            self.consistency
                .remove(&keys::build_instance_list_key(&namespace, &name, true))
                .await?;
            self.consistency
                .remove(&keys::build_instance_list_key(&namespace, &name, false))
                .await?;

            let listener: Arc<dyn RecordListener> = Arc::clone(&service) as Arc<dyn RecordListener>;
            for ephemeral in [true, false] {
                if let Err(e) = self
                    .consistency
                    .unlisten(
                        &keys::build_instance_list_key(&namespace, &name, ephemeral),
                        &listener,
                    )
                    .await
                {
                    error!(%key, error = %e, "failed to unlisten instance-list key");
                }
            }
            info!(%namespace, service = %name, "service destroyed");
        }

        if let Some(inner) = self.table.get(&namespace) {
            inner.remove(&name);
        }
        Ok(())
    }
}
