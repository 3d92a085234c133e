//! Runtime switches — live-reconfigurable knobs consulted by running
//! workers on every cycle.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Default period of the checksum status reporter.
pub const DEFAULT_STATUS_SYNC_PERIOD_MS: u64 = 60_000;

/// How instance ids are assigned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGeneratorMode {
    /// `ip#port#cluster#service`.
    #[default]
    Composite,
    /// Smallest unused non-negative integer per service.
    Snowflake,
}

impl FromStr for IdGeneratorMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("snowflake") {
            Ok(Self::Snowflake)
        } else {
            Ok(Self::Composite)
        }
    }
}

/// Shared runtime switches.
pub struct Switches {
    status_sync_period_ms: AtomicU64,
    id_generator: RwLock<IdGeneratorMode>,
}

impl Switches {
    pub fn new() -> Self {
        Self {
            status_sync_period_ms: AtomicU64::new(DEFAULT_STATUS_SYNC_PERIOD_MS),
            id_generator: RwLock::new(IdGeneratorMode::Composite),
        }
    }

    pub fn status_sync_period_ms(&self) -> u64 {
        self.status_sync_period_ms.load(Ordering::Relaxed)
    }

    pub fn set_status_sync_period_ms(&self, period_ms: u64) {
        self.status_sync_period_ms.store(period_ms, Ordering::Relaxed);
    }

    pub fn id_generator(&self) -> IdGeneratorMode {
        *self.id_generator.read()
    }

    pub fn set_id_generator(&self, mode: IdGeneratorMode) {
        *self.id_generator.write() = mode;
    }
}

impl Default for Switches {
    fn default() -> Self {
        Self::new()
    }
}
