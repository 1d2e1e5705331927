use crate::degraded::DegradedSettings;
use crate::pool::PoolStats;
use crate::pressure::{LevelThreshold, PressureLevel, ThresholdScheme};
use crate::stats::CleanupStatistics;
use serde::Serialize;

/// Point-in-time snapshot of the memory subsystem, for status output and
/// telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub level: PressureLevel,
    pub degraded: DegradedSettings,
    /// Resident bytes at the last successful sample, if any.
    pub resident_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub scheme: ThresholdScheme,
    pub thresholds: Vec<LevelThreshold>,
    pub pools: Vec<PoolStats>,
    pub handlers: Vec<String>,
    pub statistics: CleanupStatistics,
}

impl MemoryReport {
    /// Bytes currently held across all pools.
    pub fn pool_usage_bytes(&self) -> u64 {
        self.pools
            .iter()
            .fold(0u64, |total, pool| total.saturating_add(pool.usage_bytes))
    }

    /// Bytes of headroom before the next activation threshold, or `None`
    /// when usage is unknown or already above the highest threshold.
    pub fn headroom_bytes(&self) -> Option<u64> {
        let resident = self.resident_bytes?;
        self.thresholds
            .iter()
            .find(|threshold| threshold.bytes > resident)
            .map(|threshold| threshold.bytes - resident)
    }
}
