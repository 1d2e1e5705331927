//! Memory-pressure monitoring and tiered cleanup for long-running processes.
//!
//! The moving parts:
//! - A [`UsageSampler`] reads resident memory through a [`MemoryQuery`] and
//!   a [`PressureClassifier`] maps each reading onto a [`PressureLevel`].
//! - Subsystems register [`CleanupHandler`]s by name and priority tier in a
//!   [`CleanupRegistry`]; [`ResourcePool`]s provide a ready-made handler.
//! - The [`CleanupOrchestrator`] runs at most one pass at a time, executing
//!   eligible tiers in order and stopping early once usage is back under the
//!   pass's threshold. The freed figure it reports is always the measured
//!   resident delta, never the handlers' own claims.
//! - [`PressureEvent`]s fan out to subscribers over a [`PressureEventBus`].
//!
//! [`MemorySystem`] wires all of the above from a [`MemoryOptions`].

mod budget;
mod cleanup;
mod clock;
mod degraded;
mod error;
mod events;
mod monitor;
mod options;
mod orchestrator;
mod pool;
mod pressure;
mod query;
mod registry;
mod report;
mod sampler;
mod stats;
mod system;

pub use budget::{format_bytes, parse_byte_size, GB, KB, MB};
pub use cleanup::{
    handler_fn, CleanupContext, CleanupHandler, CleanupMetadata, CleanupPriority, CleanupResult,
    FnCleanupHandler,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use degraded::{BackgroundWorkMode, DegradedSettings};
pub use error::MemoryError;
pub use events::{EventSubscription, PressureEvent, PressureEventBus};
pub use monitor::{spawn_monitor, MonitorHandle};
pub use options::{MemoryOptions, ThresholdOptions};
pub use orchestrator::{
    CleanupOrchestrator, CleanupTrigger, OrchestratorConfig, OrchestratorState, TickReport,
};
pub use pool::{ManagedPool, PoolConfig, PoolStats, ResourcePool};
pub use pressure::{
    classify, detect_transition, LevelThreshold, PressureClassifier, PressureLevel,
    PressureThresholds, ThresholdScheme,
};
pub use query::{MemoryQuery, SystemMemoryQuery};
pub use registry::{CleanupRegistry, RegisteredHandler};
pub use report::MemoryReport;
pub use sampler::{UsageReading, UsageSampler};
pub use stats::CleanupStatistics;
pub use system::MemorySystem;
