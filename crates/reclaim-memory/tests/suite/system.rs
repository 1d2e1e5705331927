use crate::suite::support::{calls, counting_handler, FakeMemory, SEC};
use pretty_assertions::assert_eq;
use reclaim_memory::{
    CleanupPriority, ManualClock, MemoryOptions, MemorySystem, PressureLevel, ThresholdOptions, MB,
};
use std::sync::Arc;
use std::time::Duration;

fn options() -> MemoryOptions {
    let mut options = MemoryOptions {
        max_budget_bytes: 200 * MB,
        thresholds: ThresholdOptions::Percentage {
            warning: Some(0.6),
            critical: 0.8,
            emergency: Some(0.9),
        },
        sampling_interval: Duration::from_secs(5),
        ..MemoryOptions::default()
    };
    options.pool_capacities.insert("textures".into(), 16 * MB);
    options
}

fn system(resident_bytes: u64) -> (MemorySystem, Arc<FakeMemory>, Arc<ManualClock>) {
    let memory = FakeMemory::new(resident_bytes);
    let clock = Arc::new(ManualClock::new());
    let system = MemorySystem::with_clock(options(), memory.clone(), clock.clone()).unwrap();
    (system, memory, clock)
}

#[test]
fn invalid_thresholds_fail_construction() {
    let options = MemoryOptions {
        thresholds: ThresholdOptions::Absolute {
            warning: Some(500 * MB),
            critical: 100 * MB,
            emergency: None,
        },
        ..MemoryOptions::default()
    };
    let err = MemorySystem::new(options, FakeMemory::new(0)).unwrap_err();
    assert!(err.to_string().contains("must be below"), "{err}");
}

#[test]
fn pools_take_their_configured_capacity_and_register_a_handler() {
    let (system, _memory, _clock) = system(0);
    let textures = system.create_pool::<Vec<u8>>("textures", CleanupPriority::Medium);
    let meshes = system.create_pool::<Vec<u8>>("meshes", CleanupPriority::High);

    assert_eq!(textures.capacity_bytes(), 16 * MB);
    assert_eq!(meshes.capacity_bytes(), system.options().default_pool_capacity_bytes);
    assert_eq!(system.registry().len(), 2);

    assert_eq!(system.unregister_cleanup_handler("textures"), 1);
    assert_eq!(system.registry().len(), 1);
}

#[tokio::test]
async fn emergency_pass_empties_pools_through_the_system() {
    let (system, _memory, _clock) = system(195 * MB);
    let textures = system.create_pool::<Vec<u8>>("textures", CleanupPriority::Medium);
    textures.store("albedo", vec![1, 2, 3], 4 * MB);

    let report = system.tick().await;

    assert_eq!(report.level, PressureLevel::Emergency);
    assert!(textures.is_empty());
    assert_eq!(system.current_level(), PressureLevel::Emergency);
    assert!(!system.degraded_settings().optional_features_enabled);
}

#[tokio::test]
async fn report_reflects_pools_handlers_and_statistics() {
    let (system, memory, _clock) = system(130 * MB);
    let textures = system.create_pool::<Vec<u8>>("textures", CleanupPriority::Medium);
    textures.store("a", vec![0], 2 * MB);
    let (handler, _) = counting_handler(&memory, 0);
    system.register_cleanup_handler(CleanupPriority::Low, "temp-files", handler);

    system.perform_manual_cleanup().await;
    system.tick().await;
    let report = system.report();

    assert_eq!(report.level, PressureLevel::Warning);
    assert_eq!(report.resident_bytes, Some(130 * MB));
    assert_eq!(report.total_bytes, Some(2048 * MB));
    assert_eq!(report.pool_usage_bytes(), 2 * MB);
    assert_eq!(report.pools[0].name, "textures");
    assert_eq!(report.handlers, vec!["textures".to_string(), "temp-files".to_string()]);
    assert_eq!(report.statistics.manual_cleanups, 1);
    assert_eq!(report.headroom_bytes(), Some(160 * MB - 130 * MB));
}

#[tokio::test(start_paused = true)]
async fn monitor_ticks_until_shutdown() {
    let (system, memory, clock) = system(50 * MB);
    let (handler, counter) = counting_handler(&memory, 0);
    system.register_cleanup_handler(CleanupPriority::High, "watcher", handler);
    let mut events = system.subscribe();

    system.start();
    system.start();
    assert!(system.is_running());

    tokio::time::sleep(Duration::from_secs(1)).await;
    memory.set(170 * MB);
    clock.advance(SEC);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(system.current_level(), PressureLevel::Critical);
    assert!(calls(&counter) >= 1);

    system.shutdown().await;
    assert!(!system.is_running());
    assert!(system.registry().is_empty());

    let seen = events.drain();
    assert!(!seen.is_empty());
}
