use crate::error::MemoryError;
use crate::pool::PoolConfig;
use crate::pressure::{PressureLevel, PressureThresholds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Activation thresholds as configured, before resolution to bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ThresholdOptions {
    /// Fractions of `max_budget_bytes`.
    Percentage {
        warning: Option<f64>,
        critical: f64,
        emergency: Option<f64>,
    },
    /// Absolute resident byte counts.
    Absolute {
        warning: Option<u64>,
        critical: u64,
        emergency: Option<u64>,
    },
}

impl ThresholdOptions {
    pub fn resolve(&self, max_budget_bytes: u64) -> Result<PressureThresholds, MemoryError> {
        match *self {
            ThresholdOptions::Percentage {
                warning,
                critical,
                emergency,
            } => {
                let fractions: Vec<_> = levels(warning, critical, emergency).collect();
                PressureThresholds::percentage(max_budget_bytes, &fractions)
            }
            ThresholdOptions::Absolute {
                warning,
                critical,
                emergency,
            } => {
                let bytes: Vec<_> = levels(warning, critical, emergency).collect();
                PressureThresholds::absolute(&bytes)
            }
        }
    }
}

fn levels<T>(
    warning: Option<T>,
    critical: T,
    emergency: Option<T>,
) -> impl Iterator<Item = (PressureLevel, T)> {
    warning
        .map(|value| (PressureLevel::Warning, value))
        .into_iter()
        .chain(std::iter::once((PressureLevel::Critical, critical)))
        .chain(emergency.map(|value| (PressureLevel::Emergency, value)))
}

impl Default for ThresholdOptions {
    fn default() -> Self {
        ThresholdOptions::Percentage {
            warning: Some(0.70),
            critical: 0.85,
            emergency: Some(0.95),
        }
    }
}

/// Everything the memory subsystem is configured with. Read-only once a
/// [`crate::MemorySystem`] has been built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryOptions {
    /// Total memory ceiling that percentage thresholds are relative to.
    pub max_budget_bytes: u64,
    pub thresholds: ThresholdOptions,
    pub sampling_interval: Duration,
    /// Minimum gap between the end of one pass and an automatic pass.
    pub cooldown: Duration,
    /// Minimum gap between two advisory events.
    pub advisory_cooldown: Duration,
    /// Upper bound on a single handler invocation. `None` waits forever.
    pub handler_timeout: Option<Duration>,
    pub default_pool_capacity_bytes: u64,
    pub pool_capacities: BTreeMap<String, u64>,
    pub idle_window: Duration,
    pub aggressive_idle_window: Duration,
}

impl MemoryOptions {
    pub fn thresholds(&self) -> Result<PressureThresholds, MemoryError> {
        self.thresholds.resolve(self.max_budget_bytes)
    }

    /// Pool sizing for `name`, falling back to the default capacity.
    pub fn pool_config(&self, name: &str) -> PoolConfig {
        PoolConfig {
            capacity_bytes: self
                .pool_capacities
                .get(name)
                .copied()
                .unwrap_or(self.default_pool_capacity_bytes),
            idle_window: self.idle_window,
            aggressive_idle_window: self.aggressive_idle_window,
        }
    }
}

impl Default for MemoryOptions {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_budget_bytes: crate::GB,
            thresholds: ThresholdOptions::default(),
            sampling_interval: Duration::from_secs(5),
            cooldown: Duration::from_secs(30),
            advisory_cooldown: Duration::from_secs(120),
            handler_timeout: None,
            default_pool_capacity_bytes: pool.capacity_bytes,
            pool_capacities: BTreeMap::new(),
            idle_window: pool.idle_window,
            aggressive_idle_window: pool.aggressive_idle_window,
        }
    }
}
