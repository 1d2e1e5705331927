use crate::cleanup::{CleanupHandler, CleanupPriority};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A handler together with the name and tier it was registered under.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub name: Arc<str>,
    pub priority: CleanupPriority,
    pub handler: Arc<dyn CleanupHandler>,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Named cleanup handlers grouped by priority tier.
///
/// Registration is explicit; nothing is registered implicitly. Registering
/// the same name twice keeps both handlers (both run, in registration
/// order) and [`CleanupRegistry::unregister`] removes every handler with
/// that name.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    tiers: Arc<Mutex<BTreeMap<CleanupPriority, Vec<RegisteredHandler>>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        priority: CleanupPriority,
        name: impl Into<Arc<str>>,
        handler: Arc<dyn CleanupHandler>,
    ) {
        let name = name.into();
        let mut tiers = self.tiers.lock();
        let tier = tiers.entry(priority).or_default();
        if tier.iter().any(|existing| existing.name == name) {
            tracing::debug!(
                target: "reclaim.memory",
                handler = %name,
                ?priority,
                "registering duplicate cleanup handler name; both will run"
            );
        }
        tier.push(RegisteredHandler {
            name,
            priority,
            handler,
        });
    }

    /// Remove every handler named `name` across all tiers. Returns how many
    /// were removed.
    pub fn unregister(&self, name: &str) -> usize {
        let mut tiers = self.tiers.lock();
        let mut removed = 0;
        for tier in tiers.values_mut() {
            let before = tier.len();
            tier.retain(|registered| &*registered.name != name);
            removed += before - tier.len();
        }
        removed
    }

    /// Snapshot of the handlers in `priority`, in registration order.
    pub fn handlers_for(&self, priority: CleanupPriority) -> Vec<RegisteredHandler> {
        self.tiers
            .lock()
            .get(&priority)
            .cloned()
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<Arc<str>> {
        self.tiers
            .lock()
            .values()
            .flatten()
            .map(|registered| registered.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration (teardown).
    pub fn clear(&self) {
        self.tiers.lock().clear();
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers = self.tiers.lock();
        f.debug_map()
            .entries(
                tiers
                    .iter()
                    .map(|(priority, handlers)| (priority, handlers.len())),
            )
            .finish()
    }
}
