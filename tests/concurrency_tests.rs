mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

use isolab::simulation::{Aggregator, ContentionKind, TimeWindow};
use isolab::{
    BookingConfig, BookingSimulator, BookingStatus, IsolationLab, IsolationLevel, LabConfig,
    LabError, LoadSimulator, MemoryStorage, MemoryStorageConfig, SimulationConfig,
    TransactionSession,
};

use common::{seeded_faulty_storage, setup_lab, stock};

fn unit_quantity_config(lock_rows_on_read: bool) -> LabConfig {
    LabConfig {
        booking: BookingConfig {
            lock_rows_on_read,
            ..BookingConfig::default()
        },
        simulation: SimulationConfig {
            min_quantity: 1,
            max_quantity: 1,
            seed: Some(7),
            ..SimulationConfig::default()
        },
        ..LabConfig::default()
    }
}

#[test]
fn test_oversubscribed_stock_never_goes_negative() {
    let (lab, storage) = setup_lab(unit_quantity_config(false));

    let summary = lab
        .simulate_high_concurrency(20, 20, "READ COMMITTED")
        .unwrap();
    println!("{:?}", summary);

    assert_eq!(summary.total_operations, 20);
    assert_eq!(summary.success_count + summary.failure_count, 20);
    assert_eq!(summary.success_count, 10);
    assert_eq!(summary.units_booked, 10);
    assert_eq!(summary.final_stock, Some(0));
    assert_eq!(stock(&storage, 1), 0);
    assert_eq!(summary.insufficient_stock + summary.contention.races_lost, 10);
    assert_eq!(storage.active_sessions(), 0);
}

#[test]
fn test_every_level_conserves_stock() {
    let mut config = unit_quantity_config(true);
    config.simulation.min_quantity = 1;
    config.simulation.max_quantity = 3;
    let (lab, storage) = setup_lab(config);

    for level in IsolationLevel::ALL {
        let summary = lab
            .simulator()
            .simulate(8, 30, level)
            .unwrap();

        assert_eq!(summary.isolation_level, level);
        assert_eq!(summary.success_count + summary.failure_count, 30);
        let final_stock = summary.final_stock.unwrap();
        assert!(final_stock >= 0, "negative stock at {}", level);
        assert_eq!(summary.initial_stock - summary.units_booked, final_stock);
        assert!(summary.latency.min_ms <= summary.latency.avg_ms);
        assert!(summary.latency.avg_ms <= summary.latency.max_ms);
        assert_eq!(summary.extra_metrics["thread_pool_size"], 8.0);
        assert_eq!(storage.active_sessions(), 0);
    }
}

#[test]
fn test_zero_operations_only_resets_stock() {
    let (lab, storage) = setup_lab(LabConfig::default());
    lab.perform_concurrent_booking(1, 1, 4, "SERIALIZABLE");
    assert_eq!(stock(&storage, 1), 6);

    let summary = lab.simulate_high_concurrency(4, 0, "SERIALIZABLE").unwrap();

    assert_eq!(summary.total_operations, 0);
    assert_eq!(summary.success_count, 0);
    assert_eq!(summary.failure_count, 0);
    assert_eq!(summary.latency.avg_ms, 0.0);
    assert_eq!(summary.final_stock, Some(10));
}

#[test]
fn test_zero_workers_is_invalid_input() {
    let (lab, _storage) = setup_lab(LabConfig::default());

    let result = lab.simulate_high_concurrency(0, 10, "READ COMMITTED");

    assert!(matches!(result, Err(LabError::InvalidInput(_))));
}

#[test]
fn test_unavailable_storage_fails_simulation() {
    let (lab, storage) = setup_lab(LabConfig::default());
    storage.set_available(false);

    let result = lab.simulate_high_concurrency(2, 4, "READ COMMITTED");

    assert!(matches!(result, Err(LabError::StorageUnavailable(_))));
}

#[test]
fn test_deadline_cancels_remaining_operations() {
    let storage = Arc::new(MemoryStorage::with_config(MemoryStorageConfig {
        round_trip_latency: Duration::from_millis(10),
        ..common::fast_storage_config()
    }));
    let config = LabConfig {
        simulation: SimulationConfig {
            initial_stock: 1_000,
            deadline: Duration::from_millis(100),
            ..SimulationConfig::default()
        },
        ..LabConfig::default()
    };
    let lab = IsolationLab::new(storage.clone(), config);
    lab.reset_test_data().unwrap();

    let summary = lab.simulate_high_concurrency(2, 60, "READ COMMITTED").unwrap();

    assert_eq!(summary.total_operations, 60);
    assert_eq!(summary.success_count + summary.failure_count, 60);
    assert!(summary.timeouts > 0);
    assert!(summary.success_count < 60);
    assert_eq!(storage.active_sessions(), 0);
    assert_eq!(storage.held_locks(), 0);
    assert_eq!(
        summary.final_stock,
        Some(summary.initial_stock - summary.units_booked)
    );
}

#[test]
fn test_cancelled_operations_do_not_skew_latency() {
    let storage = Arc::new(MemoryStorage::with_config(MemoryStorageConfig {
        round_trip_latency: Duration::from_millis(10),
        ..common::fast_storage_config()
    }));
    let config = LabConfig {
        simulation: SimulationConfig {
            initial_stock: 1_000,
            deadline: Duration::from_millis(100),
            ..SimulationConfig::default()
        },
        ..LabConfig::default()
    };
    let lab = IsolationLab::new(storage.clone(), config);
    lab.reset_test_data().unwrap();

    let summary = lab.simulate_high_concurrency(2, 60, "READ COMMITTED").unwrap();
    println!("timeouts={} latency={:?}", summary.timeouts, summary.latency);

    assert!(summary.timeouts > 0);
    let timed = summary.extra_metrics["timed_operations"];
    assert!(timed >= 1.0 && timed < 60.0);
    // Every booking that started paid at least one collaborator round trip.
    assert!(summary.latency.min_ms >= 10.0);
    assert!(summary.latency.avg_ms >= summary.latency.min_ms);
    assert!(summary.latency.avg_ms <= summary.latency.max_ms);
    assert_eq!(
        summary.extra_metrics["total_response_time_ms"] / timed,
        summary.latency.avg_ms
    );
}

#[test]
fn test_aggregator_ignores_operations_that_never_ran() {
    let level = IsolationLevel::ReadCommitted;
    let ran = |ms: f64| {
        let mut result = BookingSimulator::new(
            TransactionSession::new(Arc::new(MemoryStorage::new())),
            BookingConfig::default(),
        )
        .book(1, 1, 0, level);
        result.execution_time_ms = Some(ms);
        result
    };
    let mut never_ran = ran(0.0);
    never_ran.execution_time_ms = None;
    never_ran.issue_notes = LabError::Cancelled.to_string();

    let mut aggregator = Aggregator::new();
    aggregator.record(&ran(20.0));
    aggregator.record(&ran(40.0));
    aggregator.record(&never_ran);
    let now = SystemTime::now();
    let summary = aggregator.finish(level, TimeWindow { start: now, end: now });

    assert_eq!(summary.total_operations, 3);
    assert_eq!(summary.failure_count, 3);
    assert_eq!(summary.timeouts, 1);
    assert_eq!(summary.latency.min_ms, 20.0);
    assert_eq!(summary.latency.max_ms, 40.0);
    assert_eq!(summary.latency.avg_ms, 30.0);
}

#[test]
fn test_contention_counted_from_error_text() {
    let storage = seeded_faulty_storage();
    let sessions = TransactionSession::new(storage.clone());
    let booking = BookingSimulator::new(sessions.clone(), BookingConfig::default());
    let simulator = LoadSimulator::new(booking, sessions, SimulationConfig::default());

    storage.fail_updates_with(LabError::Deadlock("products#1".to_string()));
    let summary = simulator.simulate(3, 6, IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(summary.contention.deadlocks, 6);
    assert_eq!(summary.failed, 6);

    storage.fail_updates_with(LabError::SerializationFailure("products#1".to_string()));
    let summary = simulator.simulate(3, 5, IsolationLevel::Serializable).unwrap();
    assert_eq!(summary.contention.serialization_failures, 5);
    assert_eq!(summary.contention_event_count(), 5);
    assert_eq!(summary.final_stock, Some(10));
}

#[test]
fn test_contention_keywords() {
    assert_eq!(
        ContentionKind::classify("Lock wait timeout exceeded; try restarting transaction"),
        Some(ContentionKind::Deadlock)
    );
    assert_eq!(
        ContentionKind::classify("ERROR: could not serialize access due to concurrent update"),
        Some(ContentionKind::Serialization)
    );
    assert_eq!(ContentionKind::classify("Insufficient stock"), None);
}

#[test]
fn test_concurrent_bookings_share_one_product() {
    let (lab, storage) = setup_lab(LabConfig::default());
    let lab = Arc::new(lab);
    let barrier = Arc::new(Barrier::new(5));

    let handles: Vec<_> = (1..=5)
        .map(|user| {
            let lab = lab.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                lab.perform_concurrent_booking(3, user, 2, "READ COMMITTED")
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let booked: i64 = results
        .iter()
        .filter(|r| r.status == BookingStatus::Success)
        .map(|r| r.actual_quantity)
        .sum();
    assert!(booked <= 5);
    assert_eq!(booked, 4);
    assert_eq!(stock(&storage, 3), 1);
}

#[test]
fn test_compare_isolation_levels_tabulates_every_level() {
    let config = LabConfig {
        simulation: SimulationConfig {
            comparison_workers: 4,
            comparison_operations: 12,
            seed: Some(11),
            ..SimulationConfig::default()
        },
        ..LabConfig::default()
    };
    let (lab, _storage) = setup_lab(config);

    let comparison = lab.compare_isolation_levels().unwrap();
    assert_eq!(comparison.rows.len(), 4);
    for (row, level) in comparison.rows.iter().zip(IsolationLevel::ALL) {
        assert_eq!(row.level, level);
        assert_eq!(row.total_operations, 12);
        assert!(row.success_rate >= 0.0 && row.success_rate <= 100.0);
    }
    assert!(comparison.row(IsolationLevel::Serializable).is_some());

    let batch = comparison.to_record_batch().unwrap();
    assert_eq!(batch.num_rows(), 4);
    assert_eq!(batch.num_columns(), 8);
    assert_eq!(batch.schema().field(0).name(), "isolation_level");
}
