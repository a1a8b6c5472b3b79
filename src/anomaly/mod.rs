use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::isolation::IsolationLevel;
use crate::storage::Datum;

/// Pure classification of snapshot sequences.
pub mod detection;
/// Two-session scenarios that provoke each anomaly.
pub mod scenarios;
/// Step signals between the observer and mutator sessions.
pub(crate) mod signal;

pub use detection::{Detection, EPSILON};
pub use scenarios::AnomalyDetector;

/// The read anomalies the lab can provoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Observing a value written by a transaction that later aborts.
    DirtyRead,
    /// Two reads of one row in a transaction returning different committed values.
    NonRepeatableRead,
    /// Two predicate counts in a transaction differing due to concurrent inserts.
    PhantomRead,
}

impl AnomalyKind {
    /// Weakest level at which a snapshot-based collaborator hides the anomaly.
    pub fn minimum_preventing_level(&self) -> IsolationLevel {
        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.prevents(*self))
            .unwrap_or(IsolationLevel::Serializable)
    }

    pub fn prevention_recommendations(&self) -> Vec<String> {
        let level = self.minimum_preventing_level();
        let mut advice = vec![format!("Run readers at {} or stronger", level)];
        match self {
            AnomalyKind::DirtyRead => {
                advice.push("Never make decisions on data read at READ UNCOMMITTED".to_string());
            }
            AnomalyKind::NonRepeatableRead => {
                advice.push("Read the row once and reuse the value within the transaction".to_string());
                advice.push("Take the row lock (SELECT ... FOR UPDATE) before deciding on a value".to_string());
            }
            AnomalyKind::PhantomRead => {
                advice.push("Use SERIALIZABLE when decisions depend on predicate counts".to_string());
                advice.push("Guard writes with a constraint or conditional update instead of a prior count".to_string());
            }
        }
        advice
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnomalyKind::DirtyRead => "dirty read",
            AnomalyKind::NonRepeatableRead => "non-repeatable read",
            AnomalyKind::PhantomRead => "phantom read",
        };
        f.write_str(name)
    }
}

/// One value the observer read, in capture order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Position in the observer's read order, starting at 0.
    pub sequence: u32,
    pub label: String,
    pub value: Datum,
    pub captured_at: SystemTime,
}

/// Appends snapshots with strictly increasing sequence numbers and
/// non-decreasing timestamps, even if the wall clock steps backwards.
#[derive(Debug, Default)]
pub(crate) struct SnapshotLog {
    snapshots: Vec<Snapshot>,
}

impl SnapshotLog {
    pub(crate) fn capture(&mut self, label: &str, value: Datum) {
        let now = SystemTime::now();
        let captured_at = match self.snapshots.last() {
            Some(prev) if prev.captured_at > now => prev.captured_at,
            _ => now,
        };
        self.snapshots.push(Snapshot {
            sequence: self.snapshots.len() as u32,
            label: label.to_string(),
            value,
            captured_at,
        });
    }

    pub(crate) fn into_inner(self) -> Vec<Snapshot> {
        self.snapshots
    }
}

/// Immutable record of one anomaly scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub kind: AnomalyKind,
    /// Transaction id of the observing session.
    pub observer_id: u64,
    /// Transaction id of the mutating session, if it got to open one.
    pub mutator_id: Option<u64>,
    /// Level the observer ran at.
    pub isolation_level: IsolationLevel,
    pub mutator_level: IsolationLevel,
    pub snapshots: Vec<Snapshot>,
    pub detected: bool,
    pub evidence: String,
    /// Row count change seen by the phantom observer.
    pub delta: Option<i64>,
    /// Rows the phantom mutator committed.
    pub rows_inserted: Option<u64>,
    /// Error of the mutator session, if it failed.
    pub mutator_error: Option<String>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl AnomalyResult {
    pub fn snapshot(&self, label: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.label == label)
    }

    pub fn prevention_recommendations(&self) -> Vec<String> {
        self.kind.prevention_recommendations()
    }
}
