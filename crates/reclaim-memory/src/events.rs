use crate::cleanup::CleanupResult;
use crate::degraded::DegradedSettings;
use crate::pressure::PressureLevel;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications published to subsystems outside the core (renderers,
/// streaming producers, UI).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PressureEvent {
    LevelChanged {
        from: PressureLevel,
        to: PressureLevel,
        usage_bytes: u64,
        degraded: DegradedSettings,
    },
    CleanupCompleted {
        result: CleanupResult,
        is_automatic: bool,
    },
    /// Emitted by the last-resort path; background producers should stop
    /// filling pools until [`PressureEvent::ResumeBackgroundWork`].
    PauseBackgroundWork {
        level: PressureLevel,
        usage_bytes: u64,
    },
    ResumeBackgroundWork,
    /// Rate-limited notice that pressure is staying high.
    Advisory {
        level: PressureLevel,
        usage_bytes: u64,
    },
}

/// In-process publish/subscribe for [`PressureEvent`]s.
///
/// Each subscriber owns an unbounded queue, so `publish` never waits on a
/// subscriber and no event is dropped while the subscription is alive.
#[derive(Clone, Default)]
pub struct PressureEventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<PressureEvent>>>>,
}

impl PressureEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventSubscription { rx }
    }

    pub fn publish(&self, event: PressureEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        tracing::trace!(
            target: "reclaim.memory",
            subscribers = subscribers.len(),
            ?event,
            "published pressure event"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl std::fmt::Debug for PressureEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureEventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

/// Receiving end of [`PressureEventBus::subscribe`]. Dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<PressureEvent>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<PressureEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PressureEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<PressureEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
