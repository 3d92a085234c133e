//! Contracts for the external collaborators of the registry core.
//!
//! The push broadcaster and the health-check scheduler live outside this
//! crate; the core only talks to them through these traits. No-op
//! implementations are provided for wiring and tests.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::HealthCheckerConfig;
use crate::service::Service;

/// Change-broadcast sink. Fire-and-forget: implementations enqueue and
/// return immediately.
pub trait PushSink: Send + Sync {
    fn service_changed(&self, service: &Service);
}

/// Identity of the per-service ephemeral heartbeat sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatCheckTask {
    pub namespace_id: String,
    pub service_name: String,
}

/// Identity of a per-cluster persistent health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCheckKey {
    pub namespace_id: String,
    pub service_name: String,
    pub cluster_name: String,
}

/// One inbound client heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientBeat {
    pub ip: String,
    pub port: u16,
    pub cluster: String,
    pub weight: f64,
    pub metadata: HashMap<String, String>,
}

/// Scheduler for heartbeat sweeps and persistent health checks.
pub trait HealthScheduler: Send + Sync {
    /// Start the ephemeral heartbeat-timeout sweeper for a service.
    fn schedule_check(&self, task: BeatCheckTask);

    fn cancel_check(&self, task: &BeatCheckTask);

    /// Start the persistent health check for one cluster.
    fn schedule_cluster_check(&self, key: ClusterCheckKey, config: HealthCheckerConfig);

    fn cancel_cluster_check(&self, key: &ClusterCheckKey);

    /// Process an inbound heartbeat immediately.
    fn schedule_now(&self, service: Arc<Service>, beat: ClientBeat);
}

/// Push sink that drops every notification.
#[derive(Debug, Default)]
pub struct NoopPush;

impl PushSink for NoopPush {
    fn service_changed(&self, _service: &Service) {}
}

/// Health scheduler that schedules nothing.
#[derive(Debug, Default)]
pub struct NoopHealthScheduler;

impl HealthScheduler for NoopHealthScheduler {
    fn schedule_check(&self, _task: BeatCheckTask) {}

    fn cancel_check(&self, _task: &BeatCheckTask) {}

    fn schedule_cluster_check(&self, _key: ClusterCheckKey, _config: HealthCheckerConfig) {}

    fn cancel_cluster_check(&self, _key: &ClusterCheckKey) {}

    fn schedule_now(&self, _service: Arc<Service>, _beat: ClientBeat) {}
}
