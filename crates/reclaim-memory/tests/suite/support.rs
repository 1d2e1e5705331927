use reclaim_memory::{
    handler_fn, CleanupHandler, CleanupOrchestrator, CleanupRegistry, CleanupResult, ManualClock,
    MemoryError, MemoryQuery, OrchestratorConfig, PressureEventBus, PressureLevel,
    PressureThresholds, UsageSampler, MB,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A process whose resident size is whatever the test says it is.
#[derive(Debug, Default)]
pub struct FakeMemory {
    resident: AtomicU64,
    failing: AtomicBool,
}

impl FakeMemory {
    pub fn new(resident_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            resident: AtomicU64::new(resident_bytes),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set(&self, bytes: u64) {
        self.resident.store(bytes, Ordering::SeqCst);
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .resident
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn get(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl MemoryQuery for FakeMemory {
    fn resident_bytes(&self) -> Result<u64, MemoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MemoryError::QueryFailure("injected".into()));
        }
        Ok(self.get())
    }

    fn available_bytes(&self) -> Result<u64, MemoryError> {
        Ok(1024 * MB)
    }

    fn total_bytes(&self) -> Result<u64, MemoryError> {
        Ok(2048 * MB)
    }
}

/// Warning 60%, Critical 80%, Emergency 90% of 200MB.
pub fn thresholds_200mb() -> PressureThresholds {
    PressureThresholds::percentage(
        200 * MB,
        &[
            (PressureLevel::Warning, 0.6),
            (PressureLevel::Critical, 0.8),
            (PressureLevel::Emergency, 0.9),
        ],
    )
    .unwrap()
}

pub struct Harness {
    pub memory: Arc<FakeMemory>,
    pub clock: Arc<ManualClock>,
    pub registry: CleanupRegistry,
    pub bus: PressureEventBus,
    pub orchestrator: CleanupOrchestrator,
}

impl Harness {
    pub fn new(resident_bytes: u64) -> Self {
        Self::with_config(resident_bytes, OrchestratorConfig::default())
    }

    pub fn with_config(resident_bytes: u64, config: OrchestratorConfig) -> Self {
        let memory = FakeMemory::new(resident_bytes);
        let clock = Arc::new(ManualClock::new());
        let registry = CleanupRegistry::new();
        let bus = PressureEventBus::new();
        let orchestrator = CleanupOrchestrator::new(
            UsageSampler::new(memory.clone(), clock.clone()),
            thresholds_200mb(),
            registry.clone(),
            bus.clone(),
            config,
        );
        Self {
            memory,
            clock,
            registry,
            bus,
            orchestrator,
        }
    }
}

/// A handler that counts its invocations and releases `frees` bytes from
/// `memory` each time it runs.
pub fn counting_handler(
    memory: &Arc<FakeMemory>,
    frees: u64,
) -> (Arc<dyn CleanupHandler>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let memory = memory.clone();
        let calls = calls.clone();
        move |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            memory.release(frees);
            async move { CleanupResult::freed(frees) }
        }
    });
    (handler, calls)
}

pub fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub const SEC: Duration = Duration::from_secs(1);
