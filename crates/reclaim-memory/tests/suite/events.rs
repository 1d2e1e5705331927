use crate::suite::support::{counting_handler, Harness, SEC};
use reclaim_memory::{
    BackgroundWorkMode, CleanupPriority, PressureEvent, PressureLevel, MB,
};

#[tokio::test]
async fn level_changes_carry_degraded_settings() {
    let harness = Harness::new(50 * MB);
    let mut events = harness.bus.subscribe();

    harness.orchestrator.tick().await;
    assert!(events.drain().is_empty());

    harness.memory.set(130 * MB);
    harness.clock.advance(SEC);
    harness.orchestrator.tick().await;

    match events.try_recv() {
        Some(PressureEvent::LevelChanged {
            from,
            to,
            usage_bytes,
            degraded,
        }) => {
            assert_eq!(from, PressureLevel::Normal);
            assert_eq!(to, PressureLevel::Warning);
            assert_eq!(usage_bytes, 130 * MB);
            assert_eq!(degraded.background_work, BackgroundWorkMode::Reduced);
        }
        other => panic!("expected a level change, got {other:?}"),
    }
}

#[tokio::test]
async fn completion_events_distinguish_manual_from_automatic() {
    let harness = Harness::new(170 * MB);
    let (handler, _) = counting_handler(&harness.memory, MB);
    harness.registry.register(CleanupPriority::High, "one", handler);
    let mut events = harness.bus.subscribe();

    harness.orchestrator.tick().await;
    harness.orchestrator.perform_manual_cleanup().await;

    let completions: Vec<bool> = events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            PressureEvent::CleanupCompleted { is_automatic, .. } => Some(is_automatic),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![true, false]);
}

#[tokio::test]
async fn rejected_requests_publish_nothing() {
    let harness = Harness::new(170 * MB);
    harness.orchestrator.tick().await;
    let mut events = harness.bus.subscribe();

    // Still inside the cooldown window and still Critical: no transition,
    // no pass, and the advisory is rate limited.
    harness.clock.advance(SEC);
    let report = harness.orchestrator.tick().await;

    assert!(report.cleanup.is_none());
    assert!(events.drain().is_empty());
    assert_eq!(harness.orchestrator.statistics().total_cleanups, 1);
}

#[test]
fn events_serialize_with_a_tag() {
    let event = PressureEvent::Advisory {
        level: PressureLevel::Critical,
        usage_bytes: 42,
    };
    assert_eq!(
        serde_json::to_value(&event).unwrap(),
        serde_json::json!({
            "event": "advisory",
            "level": "critical",
            "usage_bytes": 42,
        })
    );
}
