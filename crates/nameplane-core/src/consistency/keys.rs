//! Key builder for the consistency store.
//!
//! Three key families, all carrying `<namespace>##<group::name>`:
//! service meta, ephemeral instance lists, persistent instance lists.
//! The prefixes keep an existing naming-server consistency log readable
//! in place. An empty namespace parses as the default.

use crate::service::{normalize_namespace, DEFAULT_NAMESPACE};

pub const SERVICE_META_KEY_PREFIX: &str = "com.alibaba.nacos.naming.domains.meta.";
pub const INSTANCE_LIST_KEY_PREFIX: &str = "com.alibaba.nacos.naming.iplist.";
pub const BRIEF_EPHEMERAL_PREFIX: &str = "ephemeral.";
pub const NAMESPACE_CONNECTOR: &str = "##";

/// Reserved meta entry holding runtime switches; excluded from the
/// service-meta listener.
pub const SWITCH_DOMAIN_KEY: &str =
    "com.alibaba.nacos.naming.domains.meta.00-00---000-NACOS_SWITCH_DOMAIN-000---00-00";

pub fn build_service_meta_key(namespace_id: &str, service_name: &str) -> String {
    format!("{SERVICE_META_KEY_PREFIX}{namespace_id}{NAMESPACE_CONNECTOR}{service_name}")
}

pub fn build_instance_list_key(namespace_id: &str, service_name: &str, ephemeral: bool) -> String {
    if ephemeral {
        format!(
            "{INSTANCE_LIST_KEY_PREFIX}{BRIEF_EPHEMERAL_PREFIX}{namespace_id}{NAMESPACE_CONNECTOR}{service_name}"
        )
    } else {
        format!("{INSTANCE_LIST_KEY_PREFIX}{namespace_id}{NAMESPACE_CONNECTOR}{service_name}")
    }
}

pub fn match_service_meta_key(key: &str) -> bool {
    key.starts_with(SERVICE_META_KEY_PREFIX)
}

pub fn match_switch_key(key: &str) -> bool {
    key == SWITCH_DOMAIN_KEY
}

/// Any instance-list key, either plane.
pub fn match_instance_list_key_prefix(key: &str) -> bool {
    key.starts_with(INSTANCE_LIST_KEY_PREFIX)
}

pub fn match_ephemeral_instance_list_key(key: &str) -> bool {
    key.starts_with(&format!("{INSTANCE_LIST_KEY_PREFIX}{BRIEF_EPHEMERAL_PREFIX}"))
}

/// Whether `key` is an instance-list key (either plane) of the given
/// service.
pub fn match_instance_list_key(key: &str, namespace_id: &str, service_name: &str) -> bool {
    key == build_instance_list_key(namespace_id, service_name, true)
        || key == build_instance_list_key(namespace_id, service_name, false)
}

/// Split a key of any family into `(namespace, service name)`. An empty
/// namespace segment resolves to the default namespace.
pub fn parse_key(key: &str) -> Option<(String, String)> {
    let remainder = if let Some(rest) = key.strip_prefix(SERVICE_META_KEY_PREFIX) {
        rest
    } else if let Some(rest) = key.strip_prefix(INSTANCE_LIST_KEY_PREFIX) {
        rest.strip_prefix(BRIEF_EPHEMERAL_PREFIX).unwrap_or(rest)
    } else {
        return None;
    };

    let (namespace, name) = remainder.split_once(NAMESPACE_CONNECTOR)?;
    Some((normalize_namespace(namespace).to_string(), name.to_string()))
}

pub fn namespace_of(key: &str) -> String {
    parse_key(key).map(|(ns, _)| ns).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

pub fn service_name_of(key: &str) -> String {
    parse_key(key).map(|(_, name)| name).unwrap_or_default()
}
