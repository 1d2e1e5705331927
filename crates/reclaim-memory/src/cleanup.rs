use crate::error::MemoryError;
use crate::pressure::PressureLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Execution tier for cleanup handlers. Tiers always run `High`, then
/// `Medium`, then `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPriority {
    High,
    Medium,
    Low,
}

impl CleanupPriority {
    pub const ALL: [CleanupPriority; 3] = [
        CleanupPriority::High,
        CleanupPriority::Medium,
        CleanupPriority::Low,
    ];

    /// Tiers eligible to run at `level`. `Low` work (temp file scavenging and
    /// the like) waits until pressure is at least `Critical`.
    pub fn tiers_for(level: PressureLevel) -> &'static [CleanupPriority] {
        match level {
            PressureLevel::Normal | PressureLevel::Warning => {
                &[CleanupPriority::High, CleanupPriority::Medium]
            }
            PressureLevel::Critical | PressureLevel::Emergency => &Self::ALL,
        }
    }
}

/// What a handler is told about the pass invoking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupContext {
    pub level: PressureLevel,
}

impl CleanupContext {
    pub fn new(level: PressureLevel) -> Self {
        Self { level }
    }

    /// Whether handlers should use their tighter eviction policy.
    pub fn is_aggressive(&self) -> bool {
        self.level >= PressureLevel::Critical
    }
}

pub type CleanupMetadata = BTreeMap<String, serde_json::Value>;

/// Outcome of one handler invocation, or the aggregate of one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub memory_freed_bytes: i64,
    pub handlers_executed: u32,
    pub success: bool,
    pub error: Option<String>,
    pub duration_millis: Option<u64>,
    pub metadata: Option<CleanupMetadata>,
}

impl CleanupResult {
    /// A successful single-handler result.
    pub fn freed(bytes: u64) -> Self {
        Self {
            memory_freed_bytes: i64::try_from(bytes).unwrap_or(i64::MAX),
            handlers_executed: 1,
            success: true,
            error: None,
            duration_millis: None,
            metadata: None,
        }
    }

    /// A failed single-handler result.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            memory_freed_bytes: 0,
            handlers_executed: 1,
            success: false,
            error: Some(message.into()),
            duration_millis: None,
            metadata: None,
        }
    }

    /// A request that did no work at all.
    pub fn rejected(error: &MemoryError) -> Self {
        Self {
            memory_freed_bytes: 0,
            handlers_executed: 0,
            success: false,
            error: Some(error.to_string()),
            duration_millis: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref()?.get(key)
    }
}

/// A unit of work that tries to free memory and reports how much it freed.
///
/// Self-reported figures are advisory; the orchestrator measures the
/// authoritative delta itself.
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    async fn run(&self, ctx: CleanupContext) -> CleanupResult;
}

/// Adapter turning an async closure into a [`CleanupHandler`].
pub struct FnCleanupHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> CleanupHandler for FnCleanupHandler<F>
where
    F: Fn(CleanupContext) -> Fut + Send + Sync,
    Fut: Future<Output = CleanupResult> + Send,
{
    async fn run(&self, ctx: CleanupContext) -> CleanupResult {
        (self.f)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CleanupHandler>
where
    F: Fn(CleanupContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CleanupResult> + Send + 'static,
{
    Arc::new(FnCleanupHandler { f })
}
