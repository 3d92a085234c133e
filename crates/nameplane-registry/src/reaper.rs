//! Empty-service reaper.
//!
//! Instances can briefly disappear between a heartbeat timeout and a
//! re-registration, so an empty service is only removed after staying
//! empty across several consecutive sweeps. Only the peer responsible
//! for a service reaps it; the removal itself goes through the
//! consistency layer and tears down via the delete event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nameplane_core::config::EmptyServiceConfig;
use nameplane_distro::DistroRouter;

use crate::registry::ServiceRegistry;

/// Sweeps an empty service survives before removal.
pub const MAX_FINALIZE_COUNT: u32 = 3;

/// Periodic sweep deleting services that stayed empty.
pub struct EmptyServiceReaper {
    registry: Arc<ServiceRegistry>,
    router: Arc<DistroRouter>,
    initial_delay: Duration,
    period: Duration,
}

impl EmptyServiceReaper {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        router: Arc<DistroRouter>,
        config: &EmptyServiceConfig,
    ) -> Self {
        Self {
            registry,
            router,
            initial_delay: Duration::from_millis(config.clean_initial_delay_ms),
            period: Duration::from_millis(config.clean_period_ms),
        }
    }

    /// Run the sweep loop until the shutdown signal fires.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                initial_delay = ?self.initial_delay,
                period = ?self.period,
                "empty-service reaper started"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.initial_delay) => {}
                _ = shutdown.changed() => {
                    debug!("empty-service reaper shutting down");
                    return;
                }
            }
            loop {
                self.sweep().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.period) => {}
                    _ = shutdown.changed() => {
                        debug!("empty-service reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One pass over every namespace. Services owned by this peer that
    /// stay empty past the threshold are removed; a service seen
    /// non-empty resets its counter.
    pub async fn sweep(&self) {
        for namespace in self.registry.namespaces() {
            for name in self.registry.all_service_names(&namespace) {
                if !self.router.responsible(&name) {
                    continue;
                }
                let Some(service) = self.registry.get_service(&namespace, &name) else {
                    continue;
                };

                if !service.is_empty() {
                    service.set_finalize_count(0);
                    continue;
                }

                let count = service.finalize_count() + 1;
                service.set_finalize_count(count);
                debug!(%namespace, service = %name, count, "service observed empty");

                if count > MAX_FINALIZE_COUNT {
                    warn!(%namespace, service = %name, "removing service after staying empty");
                    if let Err(e) = self.registry.easy_remove_service(&namespace, &name).await {
                        error!(%namespace, service = %name, error = %e, "failed to remove empty service");
                    }
                }
            }
        }
    }
}
