use ahash::{AHashMap as HashMap, AHashSet as HashSet};

use crate::isolation::IsolationLevel;
use crate::storage::{EntityKey, Fields, RecordId};

/// Key of one field of one row.
pub type FieldKey = (EntityKey, String);

/// A record inserted by a session that has not committed yet.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub id: RecordId,
    pub kind: String,
    pub fields: Fields,
}

/// Private state of one open session inside [`MemoryStorage`](super::MemoryStorage).
///
/// Writes stay here until commit. Only the owner reads them, except that
/// sessions at `ReadUncommitted` may peek at them.
#[derive(Debug)]
pub struct TxnBuffer {
    pub level: IsolationLevel,
    /// Commit version the session reads at. Set by the first statement for
    /// `RepeatableRead` and `Serializable`; unused at weaker levels.
    pub snapshot: Option<u64>,
    pub writes: HashMap<FieldKey, crate::storage::Datum>,
    pub inserts: Vec<PendingRecord>,
    pub truncated: HashSet<String>,
    pub locks: HashSet<EntityKey>,
}

impl TxnBuffer {
    pub fn new(level: IsolationLevel) -> Self {
        Self {
            level,
            snapshot: None,
            writes: HashMap::new(),
            inserts: Vec::new(),
            truncated: HashSet::new(),
            locks: HashSet::new(),
        }
    }

    /// Whether reads go through a transaction-wide snapshot.
    pub fn uses_snapshot(&self) -> bool {
        self.level >= IsolationLevel::RepeatableRead
    }
}
