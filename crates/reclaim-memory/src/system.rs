use crate::cleanup::{CleanupHandler, CleanupPriority, CleanupResult};
use crate::clock::{Clock, SystemClock};
use crate::degraded::DegradedSettings;
use crate::error::MemoryError;
use crate::events::{EventSubscription, PressureEventBus};
use crate::monitor::{spawn_monitor, MonitorHandle};
use crate::options::MemoryOptions;
use crate::orchestrator::{CleanupOrchestrator, OrchestratorConfig, TickReport};
use crate::pool::{ManagedPool, ResourcePool};
use crate::pressure::PressureLevel;
use crate::query::{MemoryQuery, SystemMemoryQuery};
use crate::registry::CleanupRegistry;
use crate::report::MemoryReport;
use crate::sampler::UsageSampler;
use crate::stats::CleanupStatistics;
use parking_lot::Mutex;
use std::sync::Arc;

/// Composition root: owns the registry, event bus, orchestrator and the
/// optional background monitor, wired from one [`MemoryOptions`].
///
/// Clones share the same state.
#[derive(Clone)]
pub struct MemorySystem {
    inner: Arc<Inner>,
}

struct Inner {
    options: MemoryOptions,
    clock: Arc<dyn Clock>,
    registry: CleanupRegistry,
    bus: PressureEventBus,
    orchestrator: CleanupOrchestrator,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl MemorySystem {
    /// Build against the real process and wall clock.
    pub fn from_options(options: MemoryOptions) -> Result<Self, MemoryError> {
        Self::new(options, Arc::new(SystemMemoryQuery::new()))
    }

    pub fn new(options: MemoryOptions, query: Arc<dyn MemoryQuery>) -> Result<Self, MemoryError> {
        Self::with_clock(options, query, Arc::new(SystemClock))
    }

    pub fn with_clock(
        options: MemoryOptions,
        query: Arc<dyn MemoryQuery>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MemoryError> {
        let thresholds = options.thresholds()?;
        let registry = CleanupRegistry::new();
        let bus = PressureEventBus::new();
        let orchestrator = CleanupOrchestrator::new(
            UsageSampler::new(query, Arc::clone(&clock)),
            thresholds,
            registry.clone(),
            bus.clone(),
            OrchestratorConfig {
                cooldown: options.cooldown,
                advisory_cooldown: options.advisory_cooldown,
                handler_timeout: options.handler_timeout,
            },
        );

        tracing::debug!(
            target: "reclaim.memory",
            max_budget_bytes = options.max_budget_bytes,
            highest_threshold_bytes = orchestrator.thresholds().highest().bytes,
            "memory system initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                clock,
                registry,
                bus,
                orchestrator,
                monitor: Mutex::new(None),
            }),
        })
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.inner.options
    }

    pub fn orchestrator(&self) -> &CleanupOrchestrator {
        &self.inner.orchestrator
    }

    pub fn registry(&self) -> &CleanupRegistry {
        &self.inner.registry
    }

    /// Create a pool sized from the options, register its cleanup handler
    /// under `priority` (named after the pool), and make it a last-resort
    /// target.
    pub fn create_pool<V: Send + 'static>(
        &self,
        name: &str,
        priority: CleanupPriority,
    ) -> Arc<ResourcePool<V>> {
        let pool = Arc::new(ResourcePool::with_clock(
            name,
            self.inner.options.pool_config(name),
            Arc::clone(&self.inner.clock),
        ));
        self.inner
            .registry
            .register(priority, name, pool.cleanup_handler());
        self.inner
            .orchestrator
            .attach_pool(Arc::clone(&pool) as Arc<dyn ManagedPool>);
        pool
    }

    pub fn register_cleanup_handler(
        &self,
        priority: CleanupPriority,
        name: &str,
        handler: Arc<dyn CleanupHandler>,
    ) {
        self.inner.registry.register(priority, name, handler);
    }

    /// Returns how many handlers were removed.
    pub fn unregister_cleanup_handler(&self, name: &str) -> usize {
        self.inner.registry.unregister(name)
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.bus.subscribe()
    }

    pub fn current_level(&self) -> PressureLevel {
        self.inner.orchestrator.current_level()
    }

    pub fn degraded_settings(&self) -> DegradedSettings {
        DegradedSettings::for_level(self.current_level())
    }

    pub fn statistics(&self) -> CleanupStatistics {
        self.inner.orchestrator.statistics()
    }

    pub async fn tick(&self) -> TickReport {
        self.inner.orchestrator.tick().await
    }

    pub async fn perform_manual_cleanup(&self) -> CleanupResult {
        self.inner.orchestrator.perform_manual_cleanup().await
    }

    /// Start periodic sampling at the configured interval. Calling this while
    /// the monitor is already running does nothing.
    pub fn start(&self) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return;
        }
        *monitor = Some(spawn_monitor(
            self.inner.orchestrator.clone(),
            self.inner.options.sampling_interval,
        ));
    }

    pub fn is_running(&self) -> bool {
        self.inner.monitor.lock().is_some()
    }

    /// Stop the monitor (waiting for an in-flight tick), then drop every
    /// registered handler and detach all pools.
    pub async fn shutdown(&self) {
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.inner.registry.clear();
        self.inner.orchestrator.detach_pools();
        tracing::debug!(target: "reclaim.memory", "memory system shut down");
    }

    /// Snapshot for status output. System-wide figures are best effort.
    pub fn report(&self) -> MemoryReport {
        let orchestrator = &self.inner.orchestrator;
        let level = orchestrator.current_level();
        let thresholds = orchestrator.thresholds();
        let sampler = orchestrator.sampler();

        let mut pools: Vec<_> = orchestrator.pools().iter().map(|pool| pool.stats()).collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        MemoryReport {
            level,
            degraded: DegradedSettings::for_level(level),
            resident_bytes: orchestrator.last_reading().map(|r| r.resident_bytes),
            available_bytes: sampler.available_bytes().ok(),
            total_bytes: sampler.total_bytes().ok(),
            scheme: thresholds.scheme(),
            thresholds: thresholds.levels().to_vec(),
            pools,
            handlers: self
                .inner
                .registry
                .names()
                .iter()
                .map(|name| name.to_string())
                .collect(),
            statistics: orchestrator.statistics(),
        }
    }
}

impl std::fmt::Debug for MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySystem")
            .field("options", &self.inner.options)
            .field("orchestrator", &self.inner.orchestrator)
            .field("running", &self.is_running())
            .finish()
    }
}
