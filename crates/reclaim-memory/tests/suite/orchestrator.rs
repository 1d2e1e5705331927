use crate::suite::support::{calls, counting_handler, Harness, SEC};
use pretty_assertions::assert_eq;
use reclaim_memory::{
    handler_fn, CleanupPriority, CleanupResult, CleanupTrigger, OrchestratorConfig,
    OrchestratorState, PressureEvent, PressureLevel, ResourcePool, MB,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn second_concurrent_request_is_rejected_without_work() {
    let harness = Harness::new(170 * MB);
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    harness.registry.register(
        CleanupPriority::High,
        "slow",
        handler_fn({
            let started = started.clone();
            let release = release.clone();
            move |_ctx| {
                let started = started.clone();
                let release = release.clone();
                async move {
                    started.notify_one();
                    release.notified().await;
                    CleanupResult::freed(0)
                }
            }
        }),
    );

    let first = tokio::spawn({
        let orchestrator = harness.orchestrator.clone();
        async move { orchestrator.perform_manual_cleanup().await }
    });
    started.notified().await;
    assert_eq!(harness.orchestrator.state(), OrchestratorState::Running);

    let second = harness.orchestrator.perform_manual_cleanup().await;
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("cleanup already in progress"));
    assert_eq!(second.handlers_executed, 0);

    release.notify_one();
    let first = first.await.unwrap();
    assert!(first.success);
    assert_eq!(first.handlers_executed, 1);
    assert_eq!(harness.orchestrator.state(), OrchestratorState::Idle);
    assert_eq!(harness.orchestrator.statistics().total_cleanups, 1);
}

#[tokio::test]
async fn automatic_passes_respect_cooldown_but_manual_ones_do_not() {
    let harness = Harness::new(170 * MB);
    let (handler, counter) = counting_handler(&harness.memory, 0);
    harness
        .registry
        .register(CleanupPriority::High, "noop", handler);

    assert!(harness.orchestrator.tick().await.cleanup.is_some());

    harness.clock.advance(10 * SEC);
    assert!(harness.orchestrator.tick().await.cleanup.is_none());

    let manual = harness.orchestrator.perform_manual_cleanup().await;
    assert!(manual.success);

    // The manual pass restarted the cooldown window.
    harness.clock.advance(25 * SEC);
    assert!(harness.orchestrator.tick().await.cleanup.is_none());
    let suppressed = harness
        .orchestrator
        .perform_cleanup(CleanupTrigger::Automatic)
        .await;
    assert!(!suppressed.success);
    assert!(suppressed.error.unwrap().contains("cooldown"));

    harness.clock.advance(10 * SEC);
    assert!(harness.orchestrator.tick().await.cleanup.is_some());

    let stats = harness.orchestrator.statistics();
    assert_eq!(calls(&counter), 3);
    assert_eq!(stats.total_cleanups, 3);
    assert_eq!(stats.automatic_cleanups, 2);
    assert_eq!(stats.manual_cleanups, 1);
}

#[tokio::test]
async fn warning_skips_low_priority_and_critical_runs_it_once() {
    let harness = Harness::new(130 * MB);
    let (high, high_calls) = counting_handler(&harness.memory, 0);
    let (medium, medium_calls) = counting_handler(&harness.memory, 0);
    let (low, low_calls) = counting_handler(&harness.memory, 0);
    harness.registry.register(CleanupPriority::Low, "temp-files", low);
    harness.registry.register(CleanupPriority::Medium, "meshes", medium);
    harness.registry.register(CleanupPriority::High, "textures", high);

    let report = harness.orchestrator.tick().await;
    assert_eq!(report.level, PressureLevel::Warning);
    assert_eq!(report.cleanup.unwrap().handlers_executed, 2);
    assert_eq!(calls(&high_calls), 1);
    assert_eq!(calls(&medium_calls), 1);
    assert_eq!(calls(&low_calls), 0);

    harness.memory.set(170 * MB);
    harness.clock.advance(31 * SEC);
    let report = harness.orchestrator.tick().await;
    assert_eq!(report.level, PressureLevel::Critical);
    assert_eq!(report.cleanup.unwrap().handlers_executed, 3);
    assert_eq!(calls(&low_calls), 1);
}

#[tokio::test]
async fn freed_bytes_are_measured_not_self_reported() {
    let harness = Harness::new(170 * MB);
    let memory = harness.memory.clone();
    harness.registry.register(
        CleanupPriority::High,
        "optimistic",
        handler_fn(move |_ctx| {
            memory.release(3 * MB);
            async { CleanupResult::freed(5 * MB) }
        }),
    );

    let result = harness.orchestrator.perform_manual_cleanup().await;
    assert!(result.success);
    assert_eq!(result.memory_freed_bytes, (3 * MB) as i64);
    assert_eq!(
        result.metadata_value("reported_freed_bytes"),
        Some(&serde_json::json!(5 * MB))
    );
    assert_eq!(
        harness.orchestrator.statistics().total_memory_freed_bytes,
        3 * MB
    );
}

#[tokio::test]
async fn pass_stops_once_usage_is_back_under_the_level_threshold() {
    let harness = Harness::new(170 * MB);
    let (first, first_calls) = counting_handler(&harness.memory, 15 * MB);
    let (second, second_calls) = counting_handler(&harness.memory, 15 * MB);
    harness.registry.register(CleanupPriority::High, "big", first);
    harness.registry.register(CleanupPriority::Medium, "more", second);

    let result = harness.orchestrator.perform_manual_cleanup().await;

    assert_eq!(calls(&first_calls), 1);
    assert_eq!(calls(&second_calls), 0);
    assert_eq!(result.handlers_executed, 1);
    assert_eq!(result.metadata_value("early_exit"), Some(&serde_json::json!(true)));
    assert_eq!(result.memory_freed_bytes, (15 * MB) as i64);
}

#[tokio::test]
async fn failing_and_panicking_handlers_do_not_stop_the_pass() {
    let harness = Harness::new(170 * MB);
    let explode = true;
    harness.registry.register(
        CleanupPriority::High,
        "panicky",
        handler_fn(move |_ctx| async move {
            if explode {
                panic!("cache corrupted");
            }
            CleanupResult::freed(0)
        }),
    );
    harness.registry.register(
        CleanupPriority::Medium,
        "grumpy",
        handler_fn(|_ctx| async { CleanupResult::failed("disk busy") }),
    );
    let (low, low_calls) = counting_handler(&harness.memory, 2 * MB);
    harness.registry.register(CleanupPriority::Low, "scavenger", low);

    let result = harness.orchestrator.perform_manual_cleanup().await;

    assert!(!result.success);
    assert_eq!(result.handlers_executed, 3);
    assert_eq!(calls(&low_calls), 1);
    assert_eq!(result.memory_freed_bytes, (2 * MB) as i64);
    let error = result.error.unwrap();
    assert!(error.contains("panicky"), "{error}");
    assert!(error.contains("cache corrupted"), "{error}");
    assert!(error.contains("grumpy"), "{error}");
    assert!(error.contains("disk busy"), "{error}");
    assert_eq!(harness.orchestrator.state(), OrchestratorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn slow_handlers_time_out_when_a_limit_is_configured() {
    let harness = Harness::with_config(
        170 * MB,
        OrchestratorConfig {
            handler_timeout: Some(Duration::from_millis(50)),
            ..OrchestratorConfig::default()
        },
    );
    harness.registry.register(
        CleanupPriority::High,
        "stuck",
        handler_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            CleanupResult::freed(0)
        }),
    );
    let (next, next_calls) = counting_handler(&harness.memory, 0);
    harness.registry.register(CleanupPriority::High, "next", next);

    let result = harness.orchestrator.perform_manual_cleanup().await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(calls(&next_calls), 1);
}

#[tokio::test]
async fn last_resort_clears_pools_and_pauses_background_work() {
    let harness = Harness::new(195 * MB);
    let mut events = harness.bus.subscribe();
    let pool = Arc::new(ResourcePool::<Vec<u8>>::new("textures", 64 * MB));
    pool.store("albedo", vec![0; 4], 8 * MB);
    pool.store("normal", vec![0; 4], 8 * MB);
    harness.orchestrator.attach_pool(pool.clone());

    let report = harness.orchestrator.tick().await;
    assert_eq!(report.level, PressureLevel::Emergency);
    let result = report.cleanup.unwrap();
    assert_eq!(result.metadata_value("last_resort"), Some(&serde_json::json!(true)));
    assert!(pool.is_empty());
    assert_eq!(pool.usage_bytes(), 0);

    let events = events.drain();
    assert!(matches!(
        events[0],
        PressureEvent::LevelChanged {
            from: PressureLevel::Normal,
            to: PressureLevel::Emergency,
            ..
        }
    ));
    assert!(events.iter().any(|event| matches!(
        event,
        PressureEvent::PauseBackgroundWork {
            level: PressureLevel::Emergency,
            ..
        }
    )));
    assert!(matches!(
        events.last(),
        Some(PressureEvent::CleanupCompleted {
            is_automatic: true,
            ..
        })
    ));
}

#[tokio::test]
async fn background_work_resumes_when_pressure_returns_to_normal() {
    let harness = Harness::new(195 * MB);
    harness.orchestrator.tick().await;
    let mut events = harness.bus.subscribe();

    harness.memory.set(50 * MB);
    harness.clock.advance(SEC);
    let report = harness.orchestrator.tick().await;

    assert_eq!(
        report.transition,
        Some((PressureLevel::Emergency, PressureLevel::Normal))
    );
    assert!(report.cleanup.is_none());
    let events = events.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], PressureEvent::ResumeBackgroundWork);
}

#[tokio::test]
async fn query_failure_keeps_the_previous_level() {
    let harness = Harness::new(130 * MB);
    assert_eq!(harness.orchestrator.tick().await.level, PressureLevel::Warning);

    harness.memory.set_failing(true);
    harness.clock.advance(60 * SEC);
    let report = harness.orchestrator.tick().await;

    assert_eq!(report.reading, None);
    assert_eq!(report.level, PressureLevel::Warning);
    assert_eq!(report.transition, None);
    assert!(report.cleanup.is_none());
    assert_eq!(harness.orchestrator.current_level(), PressureLevel::Warning);
}

#[tokio::test]
async fn advisories_are_rate_limited_independently_of_cleanup() {
    let harness = Harness::new(170 * MB);
    let mut events = harness.bus.subscribe();
    let advisories = |events: &[PressureEvent]| {
        events
            .iter()
            .filter(|event| matches!(event, PressureEvent::Advisory { .. }))
            .count()
    };

    harness.orchestrator.tick().await;
    assert_eq!(advisories(&events.drain()), 1);

    for _ in 0..3 {
        harness.clock.advance(31 * SEC);
        harness.orchestrator.tick().await;
    }
    assert_eq!(advisories(&events.drain()), 0);

    harness.clock.advance(31 * SEC);
    harness.orchestrator.tick().await;
    assert_eq!(advisories(&events.drain()), 1);
}

#[tokio::test]
async fn manual_pass_at_normal_pressure_runs_high_and_medium() {
    let harness = Harness::new(10 * MB);
    let (high, high_calls) = counting_handler(&harness.memory, 0);
    let (low, low_calls) = counting_handler(&harness.memory, 0);
    harness.registry.register(CleanupPriority::High, "high", high);
    harness.registry.register(CleanupPriority::Low, "low", low);

    let result = harness.orchestrator.perform_manual_cleanup().await;

    assert!(result.success);
    assert_eq!(calls(&high_calls), 1);
    assert_eq!(calls(&low_calls), 0);
    assert_eq!(result.metadata_value("level"), Some(&serde_json::json!("normal")));
    assert_eq!(result.metadata_value("trigger"), Some(&serde_json::json!("manual")));
}
