mod common;

use std::sync::Arc;
use std::time::Duration;

use isolab::anomaly::detection::{AFTER_ROLLBACK, BEFORE_WRITE, DURING_WRITE, FIRST_READ, SECOND_READ};
use isolab::fixtures::{account, BALANCE, ORDERS, ORDER_STATUS};
use isolab::{
    AnomalyConfig, AnomalyDetector, AnomalyKind, Datum, IsolationLevel, LabConfig, LabError,
    MemoryStorage, MemoryStorageConfig, RecordFilter, ScenarioTiming, SyncMode,
    TransactionSession,
};

use common::{balance, seeded_faulty_storage, setup_lab};

fn timed_config() -> LabConfig {
    LabConfig {
        anomaly: AnomalyConfig {
            sync: SyncMode::Timed(ScenarioTiming {
                writer_delay: Duration::from_millis(50),
                observer_pause: Duration::from_millis(150),
                writer_hold: Duration::from_millis(300),
            }),
            ..AnomalyConfig::default()
        },
        ..LabConfig::default()
    }
}

#[test]
fn test_dirty_read_detected_at_read_uncommitted() {
    let (lab, storage) = setup_lab(LabConfig::default());

    let result = lab.demonstrate_dirty_reads(1).unwrap();
    println!("{}", result.evidence);

    assert_eq!(result.kind, AnomalyKind::DirtyRead);
    assert_eq!(result.isolation_level, IsolationLevel::ReadUncommitted);
    assert!(result.detected);
    assert_eq!(result.snapshot(BEFORE_WRITE).unwrap().value, Datum::Decimal(1000.0));
    assert_eq!(result.snapshot(DURING_WRITE).unwrap().value, Datum::Decimal(2000.0));
    assert_eq!(result.snapshot(AFTER_ROLLBACK).unwrap().value, Datum::Decimal(1000.0));
    assert!(result.mutator_error.is_none());
    assert!(result.mutator_id.is_some());
    assert!(result.started_at <= result.finished_at);

    // The uncommitted write never became durable.
    assert_eq!(balance(&storage, 1), 1000.0);
    assert_eq!(storage.active_sessions(), 0);
}

#[test]
fn test_dirty_read_prevented_at_read_committed_and_above() {
    let (lab, storage) = setup_lab(LabConfig::default());

    for level in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ] {
        let result = lab.detector().dirty_read(&account(2), level).unwrap();
        assert!(!result.detected, "dirty read detected at {}", level);
        assert_eq!(result.snapshot(DURING_WRITE).unwrap().value, Datum::Decimal(2500.0));
    }
    assert_eq!(balance(&storage, 2), 2500.0);
}

#[test]
fn test_non_repeatable_read_detected_at_read_committed() {
    let (lab, storage) = setup_lab(LabConfig::default());

    let result = lab.demonstrate_non_repeatable_reads(1).unwrap();

    assert_eq!(result.kind, AnomalyKind::NonRepeatableRead);
    assert!(result.detected);
    assert_eq!(result.snapshot(FIRST_READ).unwrap().value, Datum::Decimal(1000.0));
    assert_eq!(result.snapshot(SECOND_READ).unwrap().value, Datum::Decimal(1500.0));
    assert_eq!(balance(&storage, 1), 1500.0);
}

#[test]
fn test_non_repeatable_read_prevented_by_snapshot_levels() {
    let (lab, _storage) = setup_lab(LabConfig::default());

    for level in [IsolationLevel::RepeatableRead, IsolationLevel::Serializable] {
        let result = lab.detector().non_repeatable_read(&account(3), level).unwrap();
        assert!(!result.detected, "non-repeatable read detected at {}", level);
        let first = &result.snapshot(FIRST_READ).unwrap().value;
        let second = &result.snapshot(SECOND_READ).unwrap().value;
        assert_eq!(first, second);
    }
}

#[test]
fn test_phantom_read_delta_matches_rows_inserted() {
    let mut config = LabConfig::default();
    config.anomaly.phantom_rows = 3;
    let (lab, storage) = setup_lab(config);

    let result = lab.demonstrate_phantom_reads("PENDING").unwrap();

    assert_eq!(result.kind, AnomalyKind::PhantomRead);
    assert!(result.detected);
    assert_eq!(result.rows_inserted, Some(3));
    assert_eq!(result.delta, Some(3));
    assert_eq!(
        storage.committed_count(&RecordFilter::new(ORDERS, ORDER_STATUS, "PENDING")),
        5
    );
}

#[test]
fn test_phantom_read_prevented_by_snapshot_levels() {
    let (lab, _storage) = setup_lab(LabConfig::default());

    for level in [IsolationLevel::RepeatableRead, IsolationLevel::Serializable] {
        let result = lab.detector().phantom_read("COMPLETED", level).unwrap();
        assert!(!result.detected, "phantom read detected at {}", level);
        assert_eq!(result.delta, None);
        assert_eq!(result.rows_inserted, Some(1));
    }
}

#[test]
fn test_snapshots_are_totally_ordered() {
    let (lab, _storage) = setup_lab(LabConfig::default());

    let result = lab.demonstrate_dirty_reads(2).unwrap();

    for pair in result.snapshots.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
        assert!(pair[0].captured_at <= pair[1].captured_at);
    }
    assert_eq!(result.snapshots.len(), 3);
}

#[test]
fn test_timed_sync_mode_provokes_anomalies() {
    let (lab, storage) = setup_lab(timed_config());

    let dirty = lab.demonstrate_dirty_reads(1).unwrap();
    assert!(dirty.detected, "{}", dirty.evidence);

    let non_repeatable = lab.demonstrate_non_repeatable_reads(2).unwrap();
    assert!(non_repeatable.detected, "{}", non_repeatable.evidence);

    let phantom = lab.demonstrate_phantom_reads("CANCELLED").unwrap();
    assert!(phantom.detected, "{}", phantom.evidence);
    assert_eq!(phantom.delta, Some(1));

    assert_eq!(storage.active_sessions(), 0);
}

#[test]
fn test_failing_mutator_does_not_hang_observer() {
    let storage = seeded_faulty_storage();
    storage.fail_updates_with(LabError::StorageError("disk on fire".to_string()));
    let detector = AnomalyDetector::new(
        TransactionSession::new(storage.clone()),
        AnomalyConfig::default(),
    );

    let result = detector
        .dirty_read(&account(1), IsolationLevel::ReadUncommitted)
        .unwrap();

    assert!(!result.detected);
    assert!(result.mutator_id.is_none());
    assert!(result.mutator_error.unwrap().contains("disk on fire"));
    assert_eq!(result.snapshots.len(), 3);
    assert_eq!(storage.inner.active_sessions(), 0);
}

#[test]
fn test_unavailable_storage_fails_scenario() {
    let (lab, storage) = setup_lab(LabConfig::default());
    storage.set_available(false);

    let result = lab.demonstrate_non_repeatable_reads(1);

    assert!(matches!(result, Err(LabError::StorageUnavailable(_))));
}

#[test]
fn test_prevention_recommendations_name_preventing_level() {
    assert_eq!(
        AnomalyKind::DirtyRead.minimum_preventing_level(),
        IsolationLevel::ReadCommitted
    );
    assert_eq!(
        AnomalyKind::PhantomRead.minimum_preventing_level(),
        IsolationLevel::RepeatableRead
    );
    let advice = AnomalyKind::NonRepeatableRead.prevention_recommendations();
    assert!(advice[0].contains("REPEATABLE READ"));
}

#[test]
fn test_timed_mode_rejects_offsets_that_cannot_interleave() {
    let (lab, _storage) = setup_lab(LabConfig::default());

    for timing in [
        // Observer reads again before the mutator has written.
        ScenarioTiming {
            writer_delay: Duration::from_millis(200),
            observer_pause: Duration::from_millis(100),
            writer_hold: Duration::from_millis(800),
        },
        // Observer reads again after the mutator has already rolled back.
        ScenarioTiming {
            writer_delay: Duration::from_millis(50),
            observer_pause: Duration::from_millis(400),
            writer_hold: Duration::from_millis(100),
        },
    ] {
        assert!(timing.validate().is_err());
        let config = AnomalyConfig {
            sync: SyncMode::Timed(timing),
            ..AnomalyConfig::default()
        };
        let detector = AnomalyDetector::new(lab.sessions().clone(), config);

        let result = detector.dirty_read(&account(1), IsolationLevel::ReadUncommitted);
        assert!(matches!(result, Err(LabError::InvalidInput(_))));
    }
    assert!(ScenarioTiming::default().validate().is_ok());
}

#[test]
fn test_stalled_mutator_times_out_scenario() {
    let storage = Arc::new(MemoryStorage::with_config(MemoryStorageConfig {
        lock_wait_timeout: Duration::from_secs(1),
        ..MemoryStorageConfig::default()
    }));
    let sessions = TransactionSession::new(storage.clone());
    isolab::fixtures::seed(&sessions).unwrap();
    let detector = AnomalyDetector::new(
        sessions.clone(),
        AnomalyConfig {
            scenario_timeout: Duration::from_millis(200),
            ..AnomalyConfig::default()
        },
    );

    // Holding the row lock stalls the mutator's update past the scenario timeout.
    let mut holder = sessions.begin(IsolationLevel::ReadCommitted).unwrap();
    holder.scope().read_for_update(&account(1), BALANCE).unwrap();

    let result = detector.non_repeatable_read(&account(1), IsolationLevel::ReadCommitted);

    assert_eq!(
        result.unwrap_err(),
        LabError::Timeout(Duration::from_millis(200))
    );
    holder.rollback().unwrap();
    assert_eq!(storage.active_sessions(), 0);
    assert_eq!(storage.held_locks(), 0);
    assert_eq!(balance(&storage, 1), 1000.0);
}
