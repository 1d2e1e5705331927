use crate::cleanup::CleanupResult;
use serde::{Deserialize, Serialize};

/// Running aggregate over completed cleanup passes.
///
/// Only the orchestrator writes this, right after a pass completes. Rejected
/// or cooldown-suppressed requests are not passes and are not counted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStatistics {
    pub total_cleanups: u64,
    pub automatic_cleanups: u64,
    pub manual_cleanups: u64,
    pub total_memory_freed_bytes: u64,
    pub average_cleanup_duration_millis: f64,
    pub last_result: Option<CleanupResult>,
}

impl CleanupStatistics {
    pub(crate) fn record(&mut self, result: &CleanupResult, is_automatic: bool) {
        self.total_cleanups += 1;
        if is_automatic {
            self.automatic_cleanups += 1;
        } else {
            self.manual_cleanups += 1;
        }
        let freed = u64::try_from(result.memory_freed_bytes).unwrap_or(0);
        self.total_memory_freed_bytes = self.total_memory_freed_bytes.saturating_add(freed);

        let duration = result.duration_millis.unwrap_or(0) as f64;
        let n = self.total_cleanups as f64;
        self.average_cleanup_duration_millis += (duration - self.average_cleanup_duration_millis) / n;
        self.last_result = Some(result.clone());
    }
}
