//! The cleanup state machine.
//!
//! A pass moves the orchestrator from `Idle` to `Running` and back. Entry is
//! an atomic compare-and-set, so a periodic tick racing a manual request can
//! never start two passes; the loser gets a failed result and does no work.
//! Handlers run one at a time so the usage re-sample after each handler sees
//! a consistent figure and can stop the pass early.

use crate::cleanup::{CleanupContext, CleanupMetadata, CleanupPriority, CleanupResult};
use crate::clock::Clock;
use crate::degraded::DegradedSettings;
use crate::error::MemoryError;
use crate::events::{PressureEvent, PressureEventBus};
use crate::pool::ManagedPool;
use crate::pressure::{detect_transition, PressureClassifier, PressureLevel, PressureThresholds};
use crate::registry::{CleanupRegistry, RegisteredHandler};
use crate::sampler::{UsageReading, UsageSampler};
use crate::stats::CleanupStatistics;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
}

/// Who asked for a pass. Automatic passes honor the cooldown; manual ones
/// only honor the reentrancy guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    Automatic,
    Manual,
}

impl CleanupTrigger {
    pub fn is_automatic(self) -> bool {
        self == CleanupTrigger::Automatic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub cooldown: Duration,
    pub advisory_cooldown: Duration,
    pub handler_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            advisory_cooldown: Duration::from_secs(120),
            handler_timeout: None,
        }
    }
}

/// What a single periodic tick observed and did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// `None` when the memory query failed; the level is then carried over.
    pub reading: Option<UsageReading>,
    pub level: PressureLevel,
    pub transition: Option<(PressureLevel, PressureLevel)>,
    /// The automatic pass, if one ran.
    pub cleanup: Option<CleanupResult>,
}

struct Tracking {
    level: PressureLevel,
    last_reading: Option<UsageReading>,
    last_cleanup_at: Option<Instant>,
    last_advisory_at: Option<Instant>,
    background_paused: bool,
}

struct Inner {
    sampler: UsageSampler,
    classifier: PressureClassifier,
    registry: CleanupRegistry,
    bus: PressureEventBus,
    config: OrchestratorConfig,
    pools: Mutex<Vec<Arc<dyn ManagedPool>>>,
    running: AtomicBool,
    tracking: Mutex<Tracking>,
    stats: Mutex<CleanupStatistics>,
}

/// Central coordinator: samples, classifies, and runs tiered cleanup passes.
#[derive(Clone)]
pub struct CleanupOrchestrator {
    inner: Arc<Inner>,
}

/// Holds the `Running` state; dropping it (normally, on panic, or when the
/// pass future is cancelled) returns the orchestrator to `Idle`.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl CleanupOrchestrator {
    pub fn new(
        sampler: UsageSampler,
        thresholds: PressureThresholds,
        registry: CleanupRegistry,
        bus: PressureEventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sampler,
                classifier: PressureClassifier::new(thresholds),
                registry,
                bus,
                config,
                pools: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                tracking: Mutex::new(Tracking {
                    level: PressureLevel::Normal,
                    last_reading: None,
                    last_cleanup_at: None,
                    last_advisory_at: None,
                    background_paused: false,
                }),
                stats: Mutex::new(CleanupStatistics::default()),
            }),
        }
    }

    /// Make `pool` a target of the emergency last-resort clear.
    pub fn attach_pool(&self, pool: Arc<dyn ManagedPool>) {
        self.inner.pools.lock().push(pool);
    }

    pub fn detach_pools(&self) {
        self.inner.pools.lock().clear();
    }

    pub fn pools(&self) -> Vec<Arc<dyn ManagedPool>> {
        self.inner.pools.lock().clone()
    }

    pub fn state(&self) -> OrchestratorState {
        if self.inner.running.load(Ordering::Acquire) {
            OrchestratorState::Running
        } else {
            OrchestratorState::Idle
        }
    }

    /// Level observed by the most recent successful tick.
    pub fn current_level(&self) -> PressureLevel {
        self.inner.tracking.lock().level
    }

    pub fn last_reading(&self) -> Option<UsageReading> {
        self.inner.tracking.lock().last_reading
    }

    pub fn sampler(&self) -> &UsageSampler {
        &self.inner.sampler
    }

    pub fn thresholds(&self) -> &PressureThresholds {
        self.inner.classifier.thresholds()
    }

    pub fn statistics(&self) -> CleanupStatistics {
        self.inner.stats.lock().clone()
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.inner.config
    }

    /// One sampling interval: sample, classify, publish a transition if the
    /// level changed, and run an automatic pass while pressure is elevated.
    pub async fn tick(&self) -> TickReport {
        let reading = match self.inner.sampler.sample() {
            Ok(reading) => reading,
            Err(err) => {
                let level = self.current_level();
                tracing::warn!(
                    target: "reclaim.memory",
                    error = %err,
                    level = %level,
                    "memory sample failed; keeping previous pressure level"
                );
                return TickReport {
                    reading: None,
                    level,
                    transition: None,
                    cleanup: None,
                };
            }
        };

        let level = self.inner.classifier.classify(&reading);
        let (transition, resume, advisory) = {
            let mut tracking = self.inner.tracking.lock();
            tracking.last_reading = Some(reading);
            let transition = detect_transition(tracking.level, level);
            tracking.level = level;

            let resume = transition.is_some() && !level.is_elevated() && tracking.background_paused;
            if resume {
                tracking.background_paused = false;
            }

            let advisory = level >= PressureLevel::Critical
                && tracking.last_advisory_at.map_or(true, |at| {
                    reading.timestamp.saturating_duration_since(at) >= self.inner.config.advisory_cooldown
                });
            if advisory {
                tracking.last_advisory_at = Some(reading.timestamp);
            }
            (transition, resume, advisory)
        };

        if let Some((from, to)) = transition {
            tracing::info!(
                target: "reclaim.memory",
                from = %from,
                to = %to,
                usage_bytes = reading.resident_bytes,
                "memory pressure level changed"
            );
            self.inner.bus.publish(PressureEvent::LevelChanged {
                from,
                to,
                usage_bytes: reading.resident_bytes,
                degraded: DegradedSettings::for_level(to),
            });
        }
        if resume {
            self.inner.bus.publish(PressureEvent::ResumeBackgroundWork);
        }
        if advisory {
            tracing::warn!(
                target: "reclaim.memory",
                level = %level,
                usage_bytes = reading.resident_bytes,
                "memory pressure remains high"
            );
            self.inner.bus.publish(PressureEvent::Advisory {
                level,
                usage_bytes: reading.resident_bytes,
            });
        }

        let cleanup = if level.is_elevated() {
            match self.try_cleanup(CleanupTrigger::Automatic).await {
                Ok(result) => Some(result),
                Err(err) => {
                    tracing::debug!(
                        target: "reclaim.memory",
                        reason = %err,
                        "automatic cleanup skipped"
                    );
                    None
                }
            }
        } else {
            None
        };

        TickReport {
            reading: Some(reading),
            level,
            transition,
            cleanup,
        }
    }

    /// Run a pass now, ignoring the cooldown. Waits for the pass to finish.
    pub async fn perform_manual_cleanup(&self) -> CleanupResult {
        self.perform_cleanup(CleanupTrigger::Manual).await
    }

    /// Run a pass unless another is running (or, for automatic triggers,
    /// one finished within the cooldown). Rejections come back as a failed
    /// result with no work done.
    pub async fn perform_cleanup(&self, trigger: CleanupTrigger) -> CleanupResult {
        match self.try_cleanup(trigger).await {
            Ok(result) => result,
            Err(err) => CleanupResult::rejected(&err),
        }
    }

    async fn try_cleanup(&self, trigger: CleanupTrigger) -> Result<CleanupResult, MemoryError> {
        // Suppressed requests never enter `Running`.
        if trigger.is_automatic() {
            if let Some(remaining) = self.cooldown_remaining() {
                return Err(MemoryError::CooldownActive { remaining });
            }
        }

        let Some(guard) = self.try_begin() else {
            return Err(MemoryError::ReentrancyRejected);
        };

        let result = self.run_pass(trigger).await;
        drop(guard);
        Ok(result)
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                running: &self.inner.running,
            })
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let last = self.inner.tracking.lock().last_cleanup_at?;
        let elapsed = self.clock().now().saturating_duration_since(last);
        self.inner.config.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.inner.sampler.clock()
    }

    /// Sample, falling back to `fallback` (and logging) if the query fails.
    fn sample_or(&self, fallback: Option<UsageReading>) -> Option<UsageReading> {
        match self.inner.sampler.sample() {
            Ok(reading) => Some(reading),
            Err(err) => {
                tracing::warn!(
                    target: "reclaim.memory",
                    error = %err,
                    "memory sample failed during cleanup; using last known reading"
                );
                fallback
            }
        }
    }

    async fn run_pass(&self, trigger: CleanupTrigger) -> CleanupResult {
        let started = self.clock().now();
        let initial = self.sample_or(self.last_reading());
        let level = initial
            .map(|reading| self.inner.classifier.classify(&reading))
            .unwrap_or_else(|| self.current_level());
        let thresholds = self.inner.classifier.thresholds();
        let target = level
            .is_elevated()
            .then(|| thresholds.threshold_bytes(level))
            .flatten();
        let ctx = CleanupContext::new(level);

        tracing::debug!(
            target: "reclaim.memory",
            ?trigger,
            level = %level,
            initial_bytes = initial.map(|r| r.resident_bytes),
            target_bytes = target,
            "cleanup pass started"
        );

        let mut latest = initial;
        let mut executed = 0u32;
        let mut reported_freed = 0i64;
        let mut errors: Vec<String> = Vec::new();
        let mut early_exit = false;

        'tiers: for &priority in CleanupPriority::tiers_for(level) {
            for registered in self.inner.registry.handlers_for(priority) {
                executed = executed.saturating_add(1);
                match self.invoke(&registered, ctx).await {
                    Ok(result) => {
                        reported_freed = reported_freed.saturating_add(result.memory_freed_bytes.max(0));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "reclaim.memory",
                            handler = %registered.name,
                            ?priority,
                            error = %err,
                            "cleanup handler failed"
                        );
                        errors.push(err.to_string());
                    }
                }

                let Some(target) = target else {
                    continue;
                };
                latest = self.sample_or(latest);
                if latest.is_some_and(|reading| reading.resident_bytes <= target) {
                    early_exit = true;
                    break 'tiers;
                }
            }
        }

        let mut final_reading = self.sample_or(latest);
        let highest = thresholds.highest();
        let last_resort = !early_exit
            && final_reading.is_some_and(|reading| reading.resident_bytes >= highest.bytes);
        if last_resort {
            final_reading = self.last_resort(highest.level, final_reading);
        }

        let freed = match (initial, final_reading) {
            (Some(initial), Some(last)) => initial.resident_bytes.saturating_sub(last.resident_bytes),
            _ => 0,
        };
        let duration = self.clock().now().saturating_duration_since(started);

        let mut metadata = CleanupMetadata::new();
        metadata.insert("level".into(), level.as_str().into());
        metadata.insert("trigger".into(), format!("{trigger:?}").to_lowercase().into());
        metadata.insert("reported_freed_bytes".into(), reported_freed.into());
        metadata.insert("early_exit".into(), early_exit.into());
        metadata.insert("last_resort".into(), last_resort.into());
        if let Some(initial) = initial {
            metadata.insert("initial_bytes".into(), initial.resident_bytes.into());
        }
        if let Some(last) = final_reading {
            metadata.insert("final_bytes".into(), last.resident_bytes.into());
        }

        let result = CleanupResult {
            memory_freed_bytes: i64::try_from(freed).unwrap_or(i64::MAX),
            handlers_executed: executed,
            success: errors.is_empty(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            duration_millis: Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
            metadata: Some(metadata),
        };

        self.inner.stats.lock().record(&result, trigger.is_automatic());
        {
            let mut tracking = self.inner.tracking.lock();
            tracking.last_cleanup_at = Some(self.clock().now());
            if let Some(last) = final_reading {
                tracking.last_reading = Some(last);
            }
            if last_resort {
                tracking.background_paused = true;
            }
        }

        tracing::info!(
            target: "reclaim.memory",
            ?trigger,
            level = %level,
            freed_bytes = freed,
            reported_freed_bytes = reported_freed,
            handlers = executed,
            failures = errors.len(),
            early_exit,
            last_resort,
            "cleanup pass finished"
        );
        self.inner.bus.publish(PressureEvent::CleanupCompleted {
            result: result.clone(),
            is_automatic: trigger.is_automatic(),
        });
        result
    }

    async fn invoke(
        &self,
        registered: &RegisteredHandler,
        ctx: CleanupContext,
    ) -> Result<CleanupResult, MemoryError> {
        let run = AssertUnwindSafe(registered.handler.run(ctx)).catch_unwind();
        let outcome = match self.inner.config.handler_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(MemoryError::HandlerTimedOut {
                        name: registered.name.to_string(),
                        timeout,
                    })
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(result) if result.success => Ok(result),
            Ok(result) => Err(MemoryError::HandlerFailure {
                name: registered.name.to_string(),
                message: result
                    .error
                    .unwrap_or_else(|| "handler reported failure".to_string()),
            }),
            Err(panic) => Err(MemoryError::HandlerFailure {
                name: registered.name.to_string(),
                message: format!("panicked: {}", panic_message(&*panic)),
            }),
        }
    }

    /// Clear every attached pool, ask background producers to stop, and
    /// re-sample. Runs at most once per pass.
    fn last_resort(
        &self,
        highest: PressureLevel,
        reading: Option<UsageReading>,
    ) -> Option<UsageReading> {
        let pools = self.pools();
        let usage_bytes = reading.map_or(0, |r| r.resident_bytes);
        tracing::warn!(
            target: "reclaim.memory",
            level = %highest,
            usage_bytes,
            pools = pools.len(),
            "usage still above highest threshold after cleanup; clearing all pools"
        );

        for pool in &pools {
            pool.clear();
        }
        self.inner.bus.publish(PressureEvent::PauseBackgroundWork {
            level: highest,
            usage_bytes,
        });
        self.sample_or(reading)
    }
}

impl std::fmt::Debug for CleanupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupOrchestrator")
            .field("state", &self.state())
            .field("level", &self.current_level())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
