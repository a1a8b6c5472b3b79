use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::anomaly::AnomalyKind;
use crate::errors::{LabError, Result};

/// Defines the isolation levels a storage collaborator can be asked to run a
/// session under.
///
/// Variants are declared weakest first, so the derived `Ord` compares levels by
/// strength: `ReadUncommitted < ReadCommitted < RepeatableRead < Serializable`.
/// The engine never implements these guarantees itself; it only passes the
/// requested level through to the collaborator and interprets the effects it
/// observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// **Read Uncommitted:**
    ///
    /// Reads may observe writes of concurrent sessions that have not committed
    /// yet. Allows dirty reads, non-repeatable reads and phantom reads.
    ReadUncommitted,
    /// **Read Committed:**
    ///
    /// Every statement sees only data committed before the statement began.
    /// Prevents dirty reads. Two reads of the same row in one session may
    /// return different committed values.
    ReadCommitted,
    /// **Repeatable Read:**
    ///
    /// All statements of a session see the snapshot taken by its first
    /// statement. Prevents dirty and non-repeatable reads. Snapshot-based
    /// collaborators (PostgreSQL, [`MemoryStorage`](crate::MemoryStorage)) also
    /// hide phantom rows at this level, which the ANSI definition would permit.
    /// A write to a row changed by a concurrent commit fails with a
    /// serialization error.
    RepeatableRead,
    /// **Serializable:**
    ///
    /// The outcome matches some serial execution of the committed sessions.
    /// Prevents all three read anomalies.
    Serializable,
}

impl IsolationLevel {
    /// The process-wide set of levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// The name the collaborator understands, e.g. `READ COMMITTED`.
    pub fn sql_name(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Parses a level name, falling back to `ReadCommitted` when the name is
    /// not recognized.
    pub fn parse_or_default(name: &str) -> IsolationLevel {
        name.parse().unwrap_or(IsolationLevel::ReadCommitted)
    }

    /// Next stronger level, if any.
    pub fn stronger(&self) -> Option<IsolationLevel> {
        match self {
            IsolationLevel::ReadUncommitted => Some(IsolationLevel::ReadCommitted),
            IsolationLevel::ReadCommitted => Some(IsolationLevel::RepeatableRead),
            IsolationLevel::RepeatableRead => Some(IsolationLevel::Serializable),
            IsolationLevel::Serializable => None,
        }
    }

    /// Next weaker level, if any.
    pub fn weaker(&self) -> Option<IsolationLevel> {
        match self {
            IsolationLevel::ReadUncommitted => None,
            IsolationLevel::ReadCommitted => Some(IsolationLevel::ReadUncommitted),
            IsolationLevel::RepeatableRead => Some(IsolationLevel::ReadCommitted),
            IsolationLevel::Serializable => Some(IsolationLevel::RepeatableRead),
        }
    }

    /// Whether a snapshot-based collaborator running at this level keeps the
    /// given anomaly from being observed.
    pub fn prevents(&self, anomaly: AnomalyKind) -> bool {
        match anomaly {
            AnomalyKind::DirtyRead => *self >= IsolationLevel::ReadCommitted,
            AnomalyKind::NonRepeatableRead | AnomalyKind::PhantomRead => {
                *self >= IsolationLevel::RepeatableRead
            }
        }
    }

    /// Stronger levels take the row lock when reading contended stock so
    /// contenders queue up; weaker levels read without it to expose races.
    pub fn locks_rows_on_read(&self) -> bool {
        *self >= IsolationLevel::RepeatableRead
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

impl FromStr for IsolationLevel {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| if c == '_' || c == '-' { ' ' } else { c.to_ascii_uppercase() })
            .collect();
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.sql_name() == normalized)
            .ok_or_else(|| LabError::InvalidInput(format!("unknown isolation level '{}'", s)))
    }
}
