//! nameplane.toml configuration parser.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::switches::{IdGeneratorMode, Switches, DEFAULT_STATUS_SYNC_PERIOD_MS};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NamingConfig {
    pub empty_service: EmptyServiceConfig,
    pub sync: SyncConfig,
    /// "default" (composite ids) or "snowflake".
    pub instance_id_generator: String,
}

/// Empty-service auto-clean knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmptyServiceConfig {
    pub auto_clean: bool,
    pub clean_initial_delay_ms: u64,
    pub clean_period_ms: u64,
}

impl Default for EmptyServiceConfig {
    fn default() -> Self {
        Self {
            auto_clean: false,
            clean_initial_delay_ms: 60_000,
            clean_period_ms: 20_000,
        }
    }
}

/// Anti-entropy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub status_period_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            status_period_ms: DEFAULT_STATUS_SYNC_PERIOD_MS,
        }
    }
}

impl NamingConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NamingConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Seed the live switches from this configuration.
    pub fn apply_to(&self, switches: &Switches) {
        switches.set_status_sync_period_ms(self.sync.status_period_ms);
        if let Ok(mode) = self.instance_id_generator.parse::<IdGeneratorMode>() {
            switches.set_id_generator(mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NamingConfig::default();
        assert!(!config.empty_service.auto_clean);
        assert_eq!(config.empty_service.clean_initial_delay_ms, 60_000);
        assert_eq!(config.empty_service.clean_period_ms, 20_000);
        assert_eq!(config.sync.status_period_ms, 60_000);
    }

    #[test]
    fn parse_partial_toml() {
        let toml_str = r#"
instance_id_generator = "snowflake"

[empty_service]
auto_clean = true
clean_period_ms = 5000

[sync]
status_period_ms = 10000
"#;
        let config: NamingConfig = toml::from_str(toml_str).unwrap();
        assert!(config.empty_service.auto_clean);
        assert_eq!(config.empty_service.clean_period_ms, 5000);
        assert_eq!(config.empty_service.clean_initial_delay_ms, 60_000);

        let switches = Switches::new();
        config.apply_to(&switches);
        assert_eq!(switches.status_sync_period_ms(), 10_000);
        assert_eq!(switches.id_generator(), IdGeneratorMode::Snowflake);
    }
}
