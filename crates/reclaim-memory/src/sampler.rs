use crate::clock::Clock;
use crate::error::MemoryError;
use crate::query::MemoryQuery;
use std::sync::Arc;
use std::time::Instant;

/// A single resident-memory observation. Never mutated after sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReading {
    pub resident_bytes: u64,
    pub timestamp: Instant,
}

/// Produces timestamped [`UsageReading`]s from a [`MemoryQuery`].
#[derive(Clone)]
pub struct UsageSampler {
    query: Arc<dyn MemoryQuery>,
    clock: Arc<dyn Clock>,
}

impl UsageSampler {
    pub fn new(query: Arc<dyn MemoryQuery>, clock: Arc<dyn Clock>) -> Self {
        Self { query, clock }
    }

    pub fn sample(&self) -> Result<UsageReading, MemoryError> {
        let resident_bytes = self.query.resident_bytes()?;
        Ok(UsageReading {
            resident_bytes,
            timestamp: self.clock.now(),
        })
    }

    pub fn available_bytes(&self) -> Result<u64, MemoryError> {
        self.query.available_bytes()
    }

    pub fn total_bytes(&self) -> Result<u64, MemoryError> {
        self.query.total_bytes()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for UsageSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageSampler").finish_non_exhaustive()
    }
}
