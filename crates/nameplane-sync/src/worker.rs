//! Downstream half of anti-entropy: divergence detection and pull.
//!
//! [`ChecksumReceiver`] handles inbound checksum reports, enqueueing every
//! service this peer does not own whose local checksum diverges (or which
//! is locally absent). [`UpdateWorker`] drains the queue, pulls the
//! authoritative snapshot from the reporting peer, and overwrites local
//! instance health.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nameplane_core::{PushSink, Service};
use nameplane_distro::DistroRouter;
use nameplane_registry::ServiceRegistry;

use crate::message::{full_service_name, ServiceChecksums, ServiceStatus};
use crate::queue::{ServiceKey, UpdateQueue};
use crate::synchronizer::Synchronizer;

/// Inbound report handler.
pub struct ChecksumReceiver {
    registry: Arc<ServiceRegistry>,
    router: Arc<DistroRouter>,
    queue: Arc<UpdateQueue>,
}

impl ChecksumReceiver {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        router: Arc<DistroRouter>,
        queue: Arc<UpdateQueue>,
    ) -> Self {
        Self {
            registry,
            router,
            queue,
        }
    }

    /// Compare a peer's report against local state and enqueue divergent
    /// services for pulling.
    pub fn handle_report(&self, source_addr: &str, report: &ServiceChecksums) {
        for (name, remote_checksum) in &report.checksums {
            // Services this peer owns are reported by us, not pulled.
            if self.router.responsible(name) {
                continue;
            }

            let diverged = match self.registry.get_service(&report.namespace_id, name) {
                Some(service) => &service.checksum() != remote_checksum,
                None => true,
            };
            if !diverged {
                continue;
            }

            debug!(
                namespace = %report.namespace_id,
                service = %name,
                peer = %source_addr,
                "checksum diverged, scheduling pull"
            );
            self.queue.push(ServiceKey {
                namespace_id: report.namespace_id.clone(),
                service_name: name.clone(),
                peer_addr: source_addr.to_string(),
                checksum: remote_checksum.clone(),
            });
        }
    }
}

/// Pull worker: takes divergent keys off the queue and dispatches each
/// pull as its own task.
pub struct UpdateWorker {
    registry: Arc<ServiceRegistry>,
    push: Arc<dyn PushSink>,
    synchronizer: Arc<dyn Synchronizer>,
    queue: Arc<UpdateQueue>,
}

impl UpdateWorker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        push: Arc<dyn PushSink>,
        synchronizer: Arc<dyn Synchronizer>,
        queue: Arc<UpdateQueue>,
    ) -> Self {
        Self {
            registry,
            push,
            synchronizer,
            queue,
        }
    }

    /// Run the dispatch loop until the shutdown signal fires.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("update worker started");
            let worker = Arc::new(self);
            loop {
                tokio::select! {
                    key = worker.queue.take() => {
                        let worker = Arc::clone(&worker);
                        tokio::spawn(async move {
                            worker.process(key).await;
                        });
                    }
                    _ = shutdown.changed() => {
                        debug!("update worker shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Pull one service's status from the reporting peer and apply it.
    pub async fn process(&self, key: ServiceKey) {
        let Some(service) = self.registry.get_service(&key.namespace_id, &key.service_name)
        else {
            debug!(
                namespace = %key.namespace_id,
                service = %key.service_name,
                "service not in local table, skipping pull"
            );
            return;
        };

        let full_name = full_service_name(&key.namespace_id, &key.service_name);
        let message = match self.synchronizer.get(&key.peer_addr, &full_name).await {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    peer = %key.peer_addr,
                    service = %key.service_name,
                    error = %e,
                    "status pull failed"
                );
                return;
            }
        };

        let status: ServiceStatus = match serde_json::from_str(&message.data) {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    peer = %key.peer_addr,
                    service = %key.service_name,
                    error = %e,
                    "malformed status payload"
                );
                return;
            }
        };

        self.apply_status(&service, &status);
    }

    fn apply_status(&self, service: &Arc<Service>, status: &ServiceStatus) {
        let health = status.health_map();
        if service.apply_remote_health(&health) {
            service.recalculate_checksum();
            self.push.service_changed(service);
            info!(service = %service.name(), "health synchronized from peer");
        }
    }
}
