use crate::anomaly::Snapshot;
use crate::errors::{LabError, Result};

/// Two values closer than this are treated as equal (0.01 currency unit).
pub const EPSILON: f64 = 0.01;

pub const BEFORE_WRITE: &str = "before write";
pub const DURING_WRITE: &str = "during uncommitted write";
pub const AFTER_ROLLBACK: &str = "after rollback";
pub const FIRST_READ: &str = "first read";
pub const SECOND_READ: &str = "second read";
pub const FIRST_COUNT: &str = "first count";
pub const SECOND_COUNT: &str = "second count";

/// Verdict over a snapshot sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub detected: bool,
    pub evidence: String,
    /// Signed change between the two counts of a phantom scenario.
    pub delta: Option<i64>,
}

fn value_of(snapshots: &[Snapshot], label: &str) -> Result<f64> {
    snapshots
        .iter()
        .find(|s| s.label == label)
        .ok_or_else(|| LabError::InvalidInput(format!("missing snapshot '{}'", label)))?
        .value
        .as_f64()
}

fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > EPSILON
}

/// A dirty read happened iff the value seen during the uncommitted write
/// differs from both the baseline and the value after rollback: the observer
/// saw something that never became durable.
pub fn classify_dirty_read(snapshots: &[Snapshot]) -> Result<Detection> {
    let before = value_of(snapshots, BEFORE_WRITE)?;
    let during = value_of(snapshots, DURING_WRITE)?;
    let after = value_of(snapshots, AFTER_ROLLBACK)?;

    let detected = differs(during, before) && differs(during, after);
    let evidence = if detected {
        format!(
            "observed uncommitted {:.2} between committed {:.2} and {:.2}; the write was rolled back",
            during, before, after
        )
    } else if differs(before, after) {
        format!(
            "value moved from {:.2} to {:.2} without an intermediate uncommitted value",
            before, after
        )
    } else {
        format!("value stayed at {:.2}; uncommitted write was not visible", before)
    };

    Ok(Detection {
        detected,
        evidence,
        delta: None,
    })
}

/// A non-repeatable read happened iff two reads of the same row differ.
pub fn classify_non_repeatable_read(snapshots: &[Snapshot]) -> Result<Detection> {
    let first = value_of(snapshots, FIRST_READ)?;
    let second = value_of(snapshots, SECOND_READ)?;

    let detected = differs(first, second);
    let evidence = if detected {
        format!("same row read as {:.2} then {:.2} in one transaction", first, second)
    } else {
        format!("both reads returned {:.2}", first)
    };

    Ok(Detection {
        detected,
        evidence,
        delta: None,
    })
}

/// A phantom read happened iff the two predicate counts differ. The delta is
/// expected to equal `rows_inserted`; a mismatch is called out in the
/// evidence since it means someone else wrote matching rows too.
pub fn classify_phantom_read(snapshots: &[Snapshot], rows_inserted: u64) -> Result<Detection> {
    let first = value_of(snapshots, FIRST_COUNT)? as i64;
    let second = value_of(snapshots, SECOND_COUNT)? as i64;

    let delta = second - first;
    let detected = delta != 0;
    let evidence = if !detected {
        format!("both counts returned {}", first)
    } else if delta == rows_inserted as i64 {
        format!(
            "count changed from {} to {}: {} phantom row(s) appeared",
            first, second, delta
        )
    } else {
        format!(
            "count changed from {} to {} but the mutator inserted {} row(s); concurrent writers interfered",
            first, second, rows_inserted
        )
    };

    Ok(Detection {
        detected,
        evidence,
        delta: detected.then_some(delta),
    })
}
