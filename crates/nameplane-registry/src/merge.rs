//! Instance-list merging.
//!
//! A registration or deregistration never mutates the table directly: it
//! computes the next authoritative instance list for one plane of one
//! service, which the caller then writes through the consistency layer.
//! The fetched remote snapshot wins on identity, but local health and
//! heartbeat survive the merge.

use std::collections::{HashMap, HashSet};

use nameplane_core::consistency::keys::build_instance_list_key;
use nameplane_core::consistency::{ConsistencyService, Record};
use nameplane_core::instance::DEFAULT_CLUSTER_NAME;
use nameplane_core::switches::IdGeneratorMode;
use nameplane_core::{Instance, NamingError, NamingResult, Service, Switches};

/// What to do with the given instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Add,
    Remove,
}

/// Compute the target instance list for one plane of `service` after
/// applying `action` to `ips`.
///
/// The current list is fetched from the consistency store (absent on
/// first use), local health and last-beat are copied onto matching remote
/// entries, and the given instances are then added (with a fresh
/// instance id) or removed by datum key. Adding must not produce an
/// empty list. The returned order is unspecified.
pub async fn merge(
    consistency: &dyn ConsistencyService,
    switches: &Switches,
    service: &Service,
    action: MergeAction,
    ephemeral: bool,
    ips: Vec<Instance>,
) -> NamingResult<Vec<Instance>> {
    let key = build_instance_list_key(service.namespace_id(), service.name(), ephemeral);
    let datum = consistency.get(&key).await?;

    let current = service.all_ips_plane(ephemeral);
    let mut current_ids: HashSet<String> = HashSet::with_capacity(current.len());
    let mut current_by_addr: HashMap<String, Instance> = HashMap::with_capacity(current.len());
    for instance in current {
        current_ids.insert(instance.instance_id.clone());
        current_by_addr.insert(instance.ip_addr(), instance);
    }

    let mut merged: HashMap<String, Instance> = HashMap::new();
    if let Some(datum) = datum {
        if let Record::Instances(instances) = datum.value {
            for mut remote in instances.instance_list {
                if let Some(local) = current_by_addr.get(&remote.ip_addr()) {
                    remote.healthy = local.healthy;
                    remote.last_beat = local.last_beat;
                }
                merged.insert(remote.datum_key(), remote);
            }
        }
    }

    for mut instance in ips {
        if instance.cluster_name.is_empty() {
            instance.cluster_name = DEFAULT_CLUSTER_NAME.to_string();
        }
        if service.cluster(&instance.cluster_name).is_none() {
            service.ensure_cluster(&instance.cluster_name);
        }

        match action {
            MergeAction::Remove => {
                merged.remove(&instance.datum_key());
            }
            MergeAction::Add => {
                if instance.service_name.is_empty() {
                    instance.service_name = service.name().to_string();
                }
                instance.instance_id = generate_instance_id(
                    switches.id_generator(),
                    &instance,
                    &mut current_ids,
                );
                merged.insert(instance.datum_key(), instance);
            }
        }
    }

    if merged.is_empty() && action == MergeAction::Add {
        return Err(NamingError::InvalidArgument(format!(
            "instance list can not be empty, service: {}",
            service.name()
        )));
    }

    Ok(merged.into_values().collect())
}

fn generate_instance_id(
    mode: IdGeneratorMode,
    instance: &Instance,
    current_ids: &mut HashSet<String>,
) -> String {
    match mode {
        IdGeneratorMode::Composite => instance.composite_id(),
        IdGeneratorMode::Snowflake => Instance::snowflake_id(current_ids),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nameplane_core::{MemoryConsistency, NoopHealthScheduler, NoopPush};

    fn service(name: &str) -> Service {
        Service::new("public", name, Arc::new(NoopPush), Arc::new(NoopHealthScheduler))
    }

    fn instance(ip: &str, port: u16) -> Instance {
        Instance::new(ip, port)
    }

    #[tokio::test]
    async fn add_to_empty_store() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        let list = merge(&store, &switches, &svc, MergeAction::Add, true, vec![instance("10.0.0.1", 80)])
            .await
            .unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].instance_id, "10.0.0.1#80#DEFAULT#DEFAULT_GROUP::svc");
        assert!(svc.cluster("DEFAULT").is_some());
    }

    #[tokio::test]
    async fn add_merges_with_stored_list() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        let first = merge(&store, &switches, &svc, MergeAction::Add, true, vec![instance("10.0.0.1", 80)])
            .await
            .unwrap();
        let key = build_instance_list_key("public", svc.name(), true);
        store
            .put(&key, Record::Instances(nameplane_core::Instances { instance_list: first }))
            .await
            .unwrap();

        let second = merge(&store, &switches, &svc, MergeAction::Add, true, vec![instance("10.0.0.2", 80)])
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn re_adding_same_address_replaces_in_place() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        let first = merge(&store, &switches, &svc, MergeAction::Add, true, vec![instance("10.0.0.1", 80)])
            .await
            .unwrap();
        let key = build_instance_list_key("public", svc.name(), true);
        store
            .put(&key, Record::Instances(nameplane_core::Instances { instance_list: first }))
            .await
            .unwrap();

        let mut replacement = instance("10.0.0.1", 80);
        replacement.weight = 5.0;
        let second = merge(&store, &switches, &svc, MergeAction::Add, true, vec![replacement])
            .await
            .unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].weight, 5.0);
    }

    #[tokio::test]
    async fn local_health_survives_remote_identity() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        // Stored snapshot says healthy, local table says otherwise.
        let mut stored = instance("10.0.0.1", 80);
        stored.healthy = true;
        let key = build_instance_list_key("public", svc.name(), true);
        store
            .put(
                &key,
                Record::Instances(nameplane_core::Instances { instance_list: vec![stored] }),
            )
            .await
            .unwrap();

        let mut local = instance("10.0.0.1", 80);
        local.healthy = false;
        local.last_beat = 42;
        svc.update_ips(vec![local], true);

        let list = merge(&store, &switches, &svc, MergeAction::Add, true, vec![instance("10.0.0.2", 80)])
            .await
            .unwrap();

        let kept = list.iter().find(|i| i.ip == "10.0.0.1").unwrap();
        assert!(!kept.healthy);
        assert_eq!(kept.last_beat, 42);
    }

    #[tokio::test]
    async fn remove_deletes_by_datum_key() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        let first = merge(
            &store,
            &switches,
            &svc,
            MergeAction::Add,
            true,
            vec![instance("10.0.0.1", 80), instance("10.0.0.2", 80)],
        )
        .await
        .unwrap();
        let key = build_instance_list_key("public", svc.name(), true);
        store
            .put(&key, Record::Instances(nameplane_core::Instances { instance_list: first }))
            .await
            .unwrap();

        let list = merge(&store, &switches, &svc, MergeAction::Remove, true, vec![instance("10.0.0.1", 80)])
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn remove_of_absent_instance_keeps_list() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        let first = merge(&store, &switches, &svc, MergeAction::Add, true, vec![instance("10.0.0.1", 80)])
            .await
            .unwrap();
        let key = build_instance_list_key("public", svc.name(), true);
        store
            .put(&key, Record::Instances(nameplane_core::Instances { instance_list: first }))
            .await
            .unwrap();

        let list = merge(&store, &switches, &svc, MergeAction::Remove, true, vec![instance("10.9.9.9", 80)])
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn add_with_empty_result_is_rejected() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        let svc = service("svc");

        let result = merge(&store, &switches, &svc, MergeAction::Add, true, vec![]).await;
        assert!(matches!(result, Err(NamingError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn snowflake_mode_assigns_smallest_unused() {
        let store = MemoryConsistency::new();
        let switches = Switches::new();
        switches.set_id_generator(IdGeneratorMode::Snowflake);
        let svc = service("svc");

        let list = merge(
            &store,
            &switches,
            &svc,
            MergeAction::Add,
            true,
            vec![instance("10.0.0.1", 80), instance("10.0.0.2", 80)],
        )
        .await
        .unwrap();

        let mut ids: Vec<String> = list.iter().map(|i| i.instance_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["0".to_string(), "1".to_string()]);
    }
}
