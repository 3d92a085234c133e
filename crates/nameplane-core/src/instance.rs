//! Instance — one endpoint registration under a cluster.
//!
//! An instance is a value object: identity (`ip`, `port`, cluster), routing
//! weight, health, and the heartbeat bookkeeping that keeps ephemeral
//! instances alive. Instances travel between peers either as JSON or in the
//! compact encoded form `ip:port_weight[_healthy[_marked]][_cluster]`.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{NamingError, NamingResult};

/// Cluster name used when a registration does not name one.
pub const DEFAULT_CLUSTER_NAME: &str = "DEFAULT";

/// Site tag for instances held in the local table.
pub const LOCALHOST_SITE: &str = "localhost";

const MAX_WEIGHT: f64 = 10_000.0;
const MIN_POSITIVE_WEIGHT: f64 = 0.01;

fn ip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):?(\d{1,5})?$").expect("valid pattern")
    })
}

fn digits_and_dots() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d|\.)+$").expect("valid pattern"))
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn default_weight() -> f64 {
    1.0
}

fn default_cluster() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

fn default_last_beat() -> i64 {
    epoch_millis()
}

/// One endpoint registration under a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    /// Routing weight in [0, 10000]; positive values below 0.01 are
    /// clamped up to 0.01.
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    /// Persistent instances only: true means administratively forced
    /// unhealthy.
    pub marked: bool,
    pub cluster_name: String,
    pub service_name: String,
    pub metadata: HashMap<String, String>,
    /// Milliseconds of the last client heartbeat.
    pub last_beat: i64,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            ip: String::new(),
            port: 0,
            weight: default_weight(),
            healthy: true,
            enabled: true,
            ephemeral: true,
            marked: false,
            cluster_name: default_cluster(),
            service_name: String::new(),
            metadata: HashMap::new(),
            last_beat: default_last_beat(),
        }
    }
}

// Port 0 is a wildcard, and the ephemeral flag is part of identity: the
// same address may exist once per plane.
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
            && (self.port == other.port || self.port == 0 || other.port == 0)
            && self.ephemeral == other.ephemeral
    }
}

impl Instance {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.trim().to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn with_cluster(ip: &str, port: u16, cluster_name: &str) -> Self {
        Self {
            ip: ip.trim().to_string(),
            port,
            cluster_name: cluster_name.to_string(),
            ..Default::default()
        }
    }

    /// `ip:port` address form, the in-memory lookup key.
    pub fn ip_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Key used inside a merged instance-list datum. The port segment is
    /// omitted for the port-0 wildcard.
    pub fn datum_key(&self) -> String {
        if self.port > 0 {
            format!("{}:{}:{}:{}", self.ip, self.port, LOCALHOST_SITE, self.cluster_name)
        } else {
            format!("{}:{}:{}", self.ip, LOCALHOST_SITE, self.cluster_name)
        }
    }

    /// Compact peer-transport encoding, the full five-field form.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}_{}_{}_{}_{}",
            self.ip, self.port, self.weight, self.healthy, self.marked, self.cluster_name
        )
    }

    /// Rendering used by the service checksum.
    pub(crate) fn checksum_entry(&self) -> String {
        format!(
            "{}:{}_{}_{}_{}",
            self.ip, self.port, self.weight, self.healthy, self.cluster_name
        )
    }

    /// Parse any of the seven documented encodings:
    /// `ip:port`, `ip:port_weight`, `ip:port_weight_cluster`,
    /// `ip:port_weight_healthy`, `ip:port_weight_healthy_cluster`,
    /// `ip:port_weight_healthy_marked`,
    /// `ip:port_weight_healthy_marked_cluster`.
    pub fn parse(config: &str) -> Option<Self> {
        let parts: Vec<&str> = config.split('_').collect();
        let caps = ip_pattern().captures(parts.first()?)?;

        let ip = caps.get(1)?.as_str();
        let port = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(0);
        let mut instance = Instance::new(ip, port);

        if let Some(weight) = parts.get(1) {
            instance.weight = weight.parse().unwrap_or(1.0);
        }

        if parts.len() > 2 {
            if let Ok(healthy) = parts[2].parse::<bool>() {
                instance.healthy = healthy;
            }
            let last = parts[parts.len() - 1];
            if last.parse::<bool>().is_err() {
                instance.cluster_name = last.to_string();
            }
        }

        if parts.len() > 3 {
            if let Ok(marked) = parts[3].parse::<bool>() {
                instance.marked = marked;
            }
        }

        Some(instance)
    }

    /// Deserialize from JSON, falling back to the encoded form, then clamp
    /// the weight and validate.
    pub fn from_json(json: &str) -> NamingResult<Self> {
        let mut instance = match serde_json::from_str::<Instance>(json) {
            Ok(instance) => instance,
            Err(_) => Self::parse(json)
                .ok_or_else(|| NamingError::InvalidArgument(format!("malformed instance: {json}")))?,
        };
        instance.clamp_weight();
        instance.validate()?;
        Ok(instance)
    }

    /// Clamp the weight into [0, 10000] with the 0.01 lower shelf for
    /// positive values.
    pub fn clamp_weight(&mut self) {
        if self.weight > MAX_WEIGHT {
            self.weight = MAX_WEIGHT;
        } else if self.weight < MIN_POSITIVE_WEIGHT && self.weight > 0.0 {
            self.weight = MIN_POSITIVE_WEIGHT;
        } else if self.weight < 0.0 {
            self.weight = 0.0;
        }
    }

    /// Check address and weight validity.
    pub fn validate(&self) -> NamingResult<()> {
        if digits_and_dots().is_match(&self.ip) && !ip_pattern().is_match(&self.ip_addr()) {
            return Err(NamingError::InvalidArgument(format!(
                "invalid instance address: {}",
                self.ip_addr()
            )));
        }
        if self.weight > MAX_WEIGHT || self.weight < 0.0 {
            return Err(NamingError::InvalidArgument(format!(
                "instance weight must lie in [0, {MAX_WEIGHT}], got {}",
                self.weight
            )));
        }
        Ok(())
    }

    /// Composite instance id: `ip#port#cluster#service`.
    pub fn composite_id(&self) -> String {
        format!(
            "{}#{}#{}#{}",
            self.ip, self.port, self.cluster_name, self.service_name
        )
    }

    /// Snowflake-mode id: the smallest non-negative integer not yet in
    /// `seen`, inserted into `seen` as a side effect.
    pub fn snowflake_id(seen: &mut HashSet<String>) -> String {
        let mut id: u64 = 0;
        while seen.contains(&id.to_string()) {
            id += 1;
        }
        let id = id.to_string();
        seen.insert(id.clone());
        id
    }
}
