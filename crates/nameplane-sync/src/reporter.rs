//! Status reporter — the upstream half of anti-entropy.
//!
//! Periodically recomputes and broadcasts the checksums of every
//! non-empty service this peer is responsible for, one report per
//! namespace, to every other peer. Send failures are logged and the
//! sweep continues; the period is re-read from the switches each cycle.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nameplane_core::Switches;
use nameplane_distro::{DistroRouter, PeerSet};
use nameplane_registry::ServiceRegistry;

use crate::message::{Message, ServiceChecksums};
use crate::synchronizer::Synchronizer;

pub struct StatusReporter {
    registry: Arc<ServiceRegistry>,
    router: Arc<DistroRouter>,
    peers: Arc<dyn PeerSet>,
    synchronizer: Arc<dyn Synchronizer>,
    switches: Arc<Switches>,
}

impl StatusReporter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        router: Arc<DistroRouter>,
        peers: Arc<dyn PeerSet>,
        synchronizer: Arc<dyn Synchronizer>,
        switches: Arc<Switches>,
    ) -> Self {
        Self {
            registry,
            router,
            peers,
            synchronizer,
            switches,
        }
    }

    /// Run the report loop until the shutdown signal fires.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("status reporter started");
            loop {
                let period =
                    std::time::Duration::from_millis(self.switches.status_sync_period_ms());
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        self.report_once().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("status reporter shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One report pass over every namespace.
    pub async fn report_once(&self) {
        let names = self.registry.all_service_names_map();
        if names.is_empty() {
            return;
        }

        let local = self.peers.local_address();
        let members = self.peers.all_members();

        for (namespace, service_names) in names {
            let mut report = ServiceChecksums::new(&namespace);
            for name in service_names {
                if !self.router.responsible(&name) {
                    continue;
                }
                let Some(service) = self.registry.get_service(&namespace, &name) else {
                    continue;
                };
                if service.is_empty() {
                    continue;
                }
                service.recalculate_checksum();
                report.add(&name, &service.checksum());
            }
            if report.is_empty() {
                continue;
            }

            let payload = match serde_json::to_string(&report) {
                Ok(json) => json,
                Err(e) => {
                    warn!(%namespace, error = %e, "failed to serialize checksum report");
                    continue;
                }
            };

            for member in &members {
                if member.address == local {
                    continue;
                }
                if let Err(e) = self
                    .synchronizer
                    .send(&member.address, Message::new(payload.clone()))
                    .await
                {
                    warn!(peer = %member.address, %namespace, error = %e, "checksum report failed");
                }
            }
            debug!(%namespace, count = report.checksums.len(), "checksum report sent");
        }
    }
}
