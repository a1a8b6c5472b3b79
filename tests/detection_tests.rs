use std::time::SystemTime;

use isolab::anomaly::detection::{
    classify_dirty_read, classify_non_repeatable_read, classify_phantom_read, AFTER_ROLLBACK,
    BEFORE_WRITE, DURING_WRITE, FIRST_COUNT, FIRST_READ, SECOND_COUNT, SECOND_READ,
};
use isolab::{Datum, IsolationLevel, LabError, Snapshot};

fn snapshots(values: &[(&str, Datum)]) -> Vec<Snapshot> {
    values
        .iter()
        .enumerate()
        .map(|(i, (label, value))| Snapshot {
            sequence: i as u32,
            label: label.to_string(),
            value: value.clone(),
            captured_at: SystemTime::now(),
        })
        .collect()
}

#[test]
fn test_dirty_read_needs_three_way_difference() {
    let seen = snapshots(&[
        (BEFORE_WRITE, Datum::Decimal(1000.0)),
        (DURING_WRITE, Datum::Decimal(2000.0)),
        (AFTER_ROLLBACK, Datum::Decimal(1000.0)),
    ]);
    assert!(classify_dirty_read(&seen).unwrap().detected);

    // A committed change seen mid-way is not a dirty read.
    let committed = snapshots(&[
        (BEFORE_WRITE, Datum::Decimal(1000.0)),
        (DURING_WRITE, Datum::Decimal(2000.0)),
        (AFTER_ROLLBACK, Datum::Decimal(2000.0)),
    ]);
    let detection = classify_dirty_read(&committed).unwrap();
    assert!(!detection.detected);

    let hidden = snapshots(&[
        (BEFORE_WRITE, Datum::Decimal(1000.0)),
        (DURING_WRITE, Datum::Decimal(1000.0)),
        (AFTER_ROLLBACK, Datum::Decimal(1000.0)),
    ]);
    assert!(!classify_dirty_read(&hidden).unwrap().detected);
}

#[test]
fn test_differences_within_epsilon_are_ignored() {
    let seen = snapshots(&[
        (FIRST_READ, Datum::Decimal(100.0)),
        (SECOND_READ, Datum::Decimal(100.005)),
    ]);
    assert!(!classify_non_repeatable_read(&seen).unwrap().detected);

    let seen = snapshots(&[
        (FIRST_READ, Datum::Decimal(100.0)),
        (SECOND_READ, Datum::Decimal(100.02)),
    ]);
    assert!(classify_non_repeatable_read(&seen).unwrap().detected);
}

#[test]
fn test_phantom_delta_and_interference() {
    let seen = snapshots(&[(FIRST_COUNT, Datum::Int(2)), (SECOND_COUNT, Datum::Int(3))]);
    let detection = classify_phantom_read(&seen, 1).unwrap();
    assert!(detection.detected);
    assert_eq!(detection.delta, Some(1));

    let detection = classify_phantom_read(&seen, 4).unwrap();
    assert!(detection.detected);
    assert!(detection.evidence.contains("interfered"));

    let stable = snapshots(&[(FIRST_COUNT, Datum::Int(2)), (SECOND_COUNT, Datum::Int(2))]);
    let detection = classify_phantom_read(&stable, 1).unwrap();
    assert!(!detection.detected);
    assert_eq!(detection.delta, None);
}

#[test]
fn test_missing_snapshot_is_invalid_input() {
    let partial = snapshots(&[(FIRST_READ, Datum::Decimal(1.0))]);
    assert!(matches!(
        classify_non_repeatable_read(&partial),
        Err(LabError::InvalidInput(_))
    ));

    let text = snapshots(&[
        (FIRST_READ, Datum::Text("a".to_string())),
        (SECOND_READ, Datum::Text("b".to_string())),
    ]);
    assert!(matches!(
        classify_non_repeatable_read(&text),
        Err(LabError::TypeMismatch(_))
    ));
}

#[test]
fn test_isolation_level_names_and_fallback() {
    assert_eq!("read_uncommitted".parse::<IsolationLevel>().unwrap(), IsolationLevel::ReadUncommitted);
    assert_eq!("Repeatable-Read".parse::<IsolationLevel>().unwrap(), IsolationLevel::RepeatableRead);
    assert_eq!("SERIALIZABLE".parse::<IsolationLevel>().unwrap(), IsolationLevel::Serializable);
    assert!("snapshot".parse::<IsolationLevel>().is_err());
    assert_eq!(IsolationLevel::parse_or_default("bogus"), IsolationLevel::ReadCommitted);

    assert!(IsolationLevel::ReadUncommitted < IsolationLevel::Serializable);
    assert_eq!(IsolationLevel::ReadCommitted.stronger(), Some(IsolationLevel::RepeatableRead));
    assert_eq!(IsolationLevel::ReadUncommitted.weaker(), None);
    assert!(!IsolationLevel::ReadCommitted.locks_rows_on_read());
    assert!(IsolationLevel::Serializable.locks_rows_on_read());
}
