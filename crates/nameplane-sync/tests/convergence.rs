//! Anti-entropy convergence: checksum reports in, pulled health out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use nameplane_core::service::grouped_name;
use nameplane_core::{
    Instance, MemoryConsistency, NoopHealthScheduler, PushSink, Service, Switches,
};
use nameplane_distro::{DistroRouter, Member, PeerTable};
use nameplane_registry::ServiceRegistry;
use nameplane_sync::{
    ChecksumReceiver, Message, ServiceChecksums, ServiceStatus, StatusReporter, Synchronizer,
    UpdateQueue, UpdateWorker,
};

const NS: &str = "public";
const PEER_A: &str = "10.0.0.1:8848";
const PEER_B: &str = "10.0.0.2:8848";

/// Counts `service_changed` calls per service name.
#[derive(Default)]
struct CountingPush {
    counts: Mutex<HashMap<String, usize>>,
}

impl CountingPush {
    fn count(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }
}

impl PushSink for CountingPush {
    fn service_changed(&self, service: &Service) {
        *self.counts.lock().entry(service.name().to_string()).or_insert(0) += 1;
    }
}

/// Synchronizer stub: records sends, answers pulls with a canned payload.
#[derive(Default)]
struct StubPeer {
    sent: Mutex<Vec<(String, Message)>>,
    status_json: Mutex<Option<String>>,
}

impl StubPeer {
    fn set_status(&self, status: &ServiceStatus) {
        *self.status_json.lock() = Some(serde_json::to_string(status).unwrap());
    }
}

#[async_trait]
impl Synchronizer for StubPeer {
    async fn send(&self, peer_addr: &str, message: Message) -> anyhow::Result<()> {
        self.sent.lock().push((peer_addr.to_string(), message));
        Ok(())
    }

    async fn get(&self, _peer_addr: &str, _full_service_name: &str) -> anyhow::Result<Message> {
        match self.status_json.lock().clone() {
            Some(json) => Ok(Message::new(json)),
            None => anyhow::bail!("peer unreachable"),
        }
    }
}

struct Downstream {
    store: Arc<MemoryConsistency>,
    registry: Arc<ServiceRegistry>,
    push: Arc<CountingPush>,
    router: Arc<DistroRouter>,
}

/// Build the downstream peer (B) with a two-node peer table.
async fn downstream() -> Downstream {
    let store = Arc::new(MemoryConsistency::new());
    let push = Arc::new(CountingPush::default());
    let registry = Arc::new(ServiceRegistry::new(
        store.clone(),
        push.clone(),
        Arc::new(NoopHealthScheduler),
        Arc::new(Switches::new()),
    ));
    registry.start().await.unwrap();

    let peers = Arc::new(PeerTable::new(
        PEER_B,
        vec![Member::alive(PEER_A), Member::alive(PEER_B)],
    ));
    let router = Arc::new(DistroRouter::new(peers));
    Downstream { store, registry, push, router }
}

/// A canonical service name the given router does not own.
fn foreign_name(router: &DistroRouter) -> String {
    (0..)
        .map(|i| grouped_name(&format!("svc-{i}")))
        .find(|n| !router.responsible(n))
        .unwrap()
}

/// A canonical service name the given router owns.
fn owned_name(router: &DistroRouter) -> String {
    (0..)
        .map(|i| grouped_name(&format!("svc-{i}")))
        .find(|n| router.responsible(n))
        .unwrap()
}

#[tokio::test]
async fn divergent_checksum_pull_overwrites_health_and_pushes_once() {
    let down = downstream().await;
    let name = foreign_name(&down.router);

    down.registry
        .register_instance(NS, &name, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    down.store.settle().await;
    let service = down.registry.get_service(NS, &name).unwrap();
    assert!(service.find_instance("10.0.0.1:8080").unwrap().healthy);

    // Peer A reports a diverging checksum and serves an unhealthy snapshot.
    let peer = Arc::new(StubPeer::default());
    peer.set_status(&ServiceStatus {
        dom: name.clone(),
        ips: vec!["10.0.0.1:8080_false".to_string()],
        checksum: "remote-sum".to_string(),
        last_ref_time: 1,
    });

    let queue = Arc::new(UpdateQueue::new());
    let receiver = ChecksumReceiver::new(down.registry.clone(), down.router.clone(), queue.clone());
    let mut report = ServiceChecksums::new(NS);
    report.add(&name, "remote-sum");
    receiver.handle_report(PEER_A, &report);
    assert_eq!(queue.len(), 1);

    let worker = UpdateWorker::new(
        down.registry.clone(),
        down.push.clone(),
        peer.clone(),
        queue.clone(),
    );
    let pushes_before = down.push.count(&name);
    let key = queue.take().await;
    worker.process(key.clone()).await;

    assert!(!service.find_instance("10.0.0.1:8080").unwrap().healthy);
    assert_eq!(down.push.count(&name), pushes_before + 1);

    // Re-applying the same snapshot changes nothing and pushes nothing.
    worker.process(key).await;
    assert_eq!(down.push.count(&name), pushes_before + 1);
}

#[tokio::test]
async fn matching_checksum_and_owned_services_are_not_enqueued() {
    let down = downstream().await;
    let foreign = foreign_name(&down.router);
    let owned = owned_name(&down.router);

    down.registry
        .register_instance(NS, &foreign, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    down.store.settle().await;
    let service = down.registry.get_service(NS, &foreign).unwrap();
    service.recalculate_checksum();

    let queue = Arc::new(UpdateQueue::new());
    let receiver = ChecksumReceiver::new(down.registry.clone(), down.router.clone(), queue.clone());

    // Matching checksum: nothing to pull.
    let mut report = ServiceChecksums::new(NS);
    report.add(&foreign, &service.checksum());
    receiver.handle_report(PEER_A, &report);
    assert!(queue.is_empty());

    // Services this peer owns are never pulled, diverging or not.
    let mut report = ServiceChecksums::new(NS);
    report.add(&owned, "whatever");
    receiver.handle_report(PEER_A, &report);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn locally_absent_service_is_enqueued_and_pull_skips() {
    let down = downstream().await;
    let name = foreign_name(&down.router);

    let queue = Arc::new(UpdateQueue::new());
    let receiver = ChecksumReceiver::new(down.registry.clone(), down.router.clone(), queue.clone());
    let mut report = ServiceChecksums::new(NS);
    report.add(&name, "remote-sum");
    receiver.handle_report(PEER_A, &report);
    assert_eq!(queue.len(), 1);

    // Pulling for a service we do not hold is a no-op, not an error.
    let worker = UpdateWorker::new(
        down.registry.clone(),
        down.push.clone(),
        Arc::new(StubPeer::default()),
        queue.clone(),
    );
    let key = queue.take().await;
    worker.process(key).await;
    assert_eq!(down.push.count(&name), 0);
}

#[tokio::test]
async fn unreachable_peer_is_skipped() {
    let down = downstream().await;
    let name = foreign_name(&down.router);

    down.registry
        .register_instance(NS, &name, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    down.store.settle().await;

    let queue = Arc::new(UpdateQueue::new());
    let worker = UpdateWorker::new(
        down.registry.clone(),
        down.push.clone(),
        Arc::new(StubPeer::default()), // no canned status: every get fails
        queue.clone(),
    );
    worker
        .process(nameplane_sync::ServiceKey {
            namespace_id: NS.to_string(),
            service_name: name.clone(),
            peer_addr: PEER_A.to_string(),
            checksum: "remote-sum".to_string(),
        })
        .await;

    // Health untouched, no push.
    let service = down.registry.get_service(NS, &name).unwrap();
    assert!(service.find_instance("10.0.0.1:8080").unwrap().healthy);
    assert_eq!(down.push.count(&name), 0);
}

#[tokio::test]
async fn spawned_worker_drains_the_queue() {
    let down = downstream().await;
    let name = foreign_name(&down.router);

    down.registry
        .register_instance(NS, &name, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    down.store.settle().await;

    let peer = Arc::new(StubPeer::default());
    peer.set_status(&ServiceStatus {
        dom: name.clone(),
        ips: vec!["10.0.0.1:8080_false".to_string()],
        checksum: "remote-sum".to_string(),
        last_ref_time: 1,
    });

    let queue = Arc::new(UpdateQueue::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = UpdateWorker::new(
        down.registry.clone(),
        down.push.clone(),
        peer,
        queue.clone(),
    )
    .spawn(shutdown_rx);

    queue.push(nameplane_sync::ServiceKey {
        namespace_id: NS.to_string(),
        service_name: name.clone(),
        peer_addr: PEER_A.to_string(),
        checksum: "remote-sum".to_string(),
    });

    let service = down.registry.get_service(NS, &name).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !service.find_instance("10.0.0.1:8080").unwrap().healthy {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "health never converged");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn reporter_broadcasts_owned_checksums_to_other_peers() {
    // Upstream peer A: owns `name`, reports to B.
    let store = Arc::new(MemoryConsistency::new());
    let push = Arc::new(CountingPush::default());
    let registry = Arc::new(ServiceRegistry::new(
        store.clone(),
        push.clone(),
        Arc::new(NoopHealthScheduler),
        Arc::new(Switches::new()),
    ));
    registry.start().await.unwrap();

    let peers = Arc::new(PeerTable::new(
        PEER_A,
        vec![Member::alive(PEER_A), Member::alive(PEER_B)],
    ));
    let router = Arc::new(DistroRouter::new(peers.clone()));
    let owned = owned_name(&router);
    let foreign = foreign_name(&router);

    registry
        .register_instance(NS, &owned, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    registry
        .register_instance(NS, &foreign, Instance::new("10.0.0.2", 8080))
        .await
        .unwrap();
    // Empty services are not reported.
    registry.create_service_if_absent(NS, "empty-svc", true, None).await.unwrap();
    store.settle().await;

    let peer = Arc::new(StubPeer::default());
    let reporter = StatusReporter::new(
        registry.clone(),
        router,
        peers,
        peer.clone(),
        Arc::new(Switches::new()),
    );
    reporter.report_once().await;

    let sent = peer.sent.lock().clone();
    assert_eq!(sent.len(), 1, "one report to the one other peer");
    let (addr, message) = &sent[0];
    assert_eq!(addr, PEER_B);

    let report: ServiceChecksums = serde_json::from_str(&message.data).unwrap();
    assert_eq!(report.namespace_id, NS);
    assert!(report.checksums.contains_key(&owned));
    assert!(!report.checksums.contains_key(&foreign), "unowned services are not reported");
    assert!(!report.checksums.contains_key(&grouped_name("empty-svc")));
    assert!(!report.checksums[&owned].is_empty());
}

#[tokio::test]
async fn full_cycle_converges_downstream_to_upstream() {
    // Upstream A.
    let up_store = Arc::new(MemoryConsistency::new());
    let up_registry = Arc::new(ServiceRegistry::new(
        up_store.clone(),
        Arc::new(CountingPush::default()),
        Arc::new(NoopHealthScheduler),
        Arc::new(Switches::new()),
    ));
    up_registry.start().await.unwrap();

    let up_peers = Arc::new(PeerTable::new(
        PEER_A,
        vec![Member::alive(PEER_A), Member::alive(PEER_B)],
    ));
    let up_router = Arc::new(DistroRouter::new(up_peers.clone()));
    let name = owned_name(&up_router);

    up_registry
        .register_instance(NS, &name, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    up_store.settle().await;
    let up_service = up_registry.get_service(NS, &name).unwrap();
    // A marks the instance unhealthy locally.
    up_service
        .cluster("DEFAULT")
        .unwrap()
        .set_healthy("10.0.0.1:8080", false);
    up_service.recalculate_checksum();

    // Downstream B holds the same instance, still healthy.
    let down = downstream().await;
    down.registry
        .register_instance(NS, &name, Instance::new("10.0.0.1", 8080))
        .await
        .unwrap();
    down.store.settle().await;

    // A's reporter runs; the wire carries A's actual report and status.
    let wire = Arc::new(StubPeer::default());
    wire.set_status(&ServiceStatus::of(&up_service));
    StatusReporter::new(
        up_registry.clone(),
        up_router,
        up_peers,
        wire.clone(),
        Arc::new(Switches::new()),
    )
    .report_once()
    .await;

    let (_, message) = wire.sent.lock()[0].clone();
    let report: ServiceChecksums = serde_json::from_str(&message.data).unwrap();

    // B receives, enqueues, pulls.
    let queue = Arc::new(UpdateQueue::new());
    ChecksumReceiver::new(down.registry.clone(), down.router.clone(), queue.clone())
        .handle_report(PEER_A, &report);
    assert_eq!(queue.len(), 1);

    let worker = UpdateWorker::new(
        down.registry.clone(),
        down.push.clone(),
        wire,
        queue.clone(),
    );
    let key = queue.take().await;
    worker.process(key).await;

    let down_service = down.registry.get_service(NS, &name).unwrap();
    assert!(!down_service.find_instance("10.0.0.1:8080").unwrap().healthy);
    assert_eq!(down_service.checksum(), up_service.checksum(), "replicas converged");
}
