use std::cmp::Ordering;
use std::fmt;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{LabError, Result};
use crate::isolation::IsolationLevel;

/// Identifier the collaborator hands out for an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Identifier of an inserted audit or booking record.
pub type RecordId = u64;

/// Named field values of a record or an entity row.
pub type Fields = HashMap<String, Datum>;

/// Addresses one row of the collaborator, e.g. `products#1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub table: String,
    pub id: u64,
}

impl EntityKey {
    pub fn new(table: impl Into<String>, id: u64) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

/// A single field value as stored by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Int(i64),
    Decimal(f64),
    Text(String),
}

impl Datum {
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Datum::Int(v) => Ok(*v),
            Datum::Decimal(v) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            other => Err(LabError::TypeMismatch(format!(
                "expected an integer, found {:?}",
                other
            ))),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Datum::Int(v) => Ok(*v as f64),
            Datum::Decimal(v) => Ok(*v),
            Datum::Text(_) => Err(LabError::TypeMismatch(format!(
                "expected a number, found {:?}",
                self
            ))),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric addition. Integer plus integer stays integral, anything
    /// involving a decimal becomes a decimal.
    pub fn add(&self, delta: &Datum) -> Result<Datum> {
        match (self, delta) {
            (Datum::Int(a), Datum::Int(b)) => a
                .checked_add(*b)
                .map(Datum::Int)
                .ok_or_else(|| LabError::InvalidInput("integer overflow".to_string())),
            (a, b) => Ok(Datum::Decimal(a.as_f64()? + b.as_f64()?)),
        }
    }

    /// Orders two values of compatible types.
    pub fn compare(&self, other: &Datum) -> Result<Ordering> {
        match (self, other) {
            (Datum::Int(a), Datum::Int(b)) => Ok(a.cmp(b)),
            (Datum::Text(a), Datum::Text(b)) => Ok(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?).ok_or_else(|| {
                LabError::TypeMismatch(format!("cannot compare {:?} with {:?}", a, b))
            }),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Int(v) => write!(f, "{}", v),
            Datum::Decimal(v) => write!(f, "{:.2}", v),
            Datum::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Decimal(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

/// Predicate a conditional update re-checks atomically against the value the
/// collaborator holds at update time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Guard {
    /// Unconditional.
    Always,
    /// `field >= value`.
    AtLeast(Datum),
}

impl Guard {
    pub fn holds(&self, current: &Datum) -> Result<bool> {
        match self {
            Guard::Always => Ok(true),
            Guard::AtLeast(bound) => Ok(current.compare(bound)? != Ordering::Less),
        }
    }
}

/// Matches records of one kind whose `field` equals `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub kind: String,
    pub field: String,
    pub equals: Datum,
}

impl RecordFilter {
    pub fn new(kind: impl Into<String>, field: impl Into<String>, equals: impl Into<Datum>) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, kind: &str, fields: &Fields) -> bool {
        kind == self.kind
            && fields
                .get(&self.field)
                .is_some_and(|value| value.compare(&self.equals) == Ok(Ordering::Equal))
    }
}

/// The narrow interface the engine consumes from the data store.
///
/// Every call runs inside a session opened with [`Storage::begin_session`] and
/// is subject to that session's isolation level. The collaborator, not the
/// engine, is responsible for visibility, row locks and the atomicity of
/// [`Storage::conditional_update`]. Any call may fail with a collaborator-level
/// error; the session layer turns those into failed operation results.
///
/// Implementations must be `Send` and `Sync` so sessions can run on many
/// threads at once.
pub trait Storage: Send + Sync {
    /// Opens a session at the given isolation level.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::StorageUnavailable`] when the collaborator cannot be
    /// reached. The session layer treats this as fatal.
    fn begin_session(&self, level: IsolationLevel) -> Result<SessionHandle>;

    /// Makes the session's writes durable and visible, then releases its locks.
    fn commit(&self, handle: SessionHandle) -> Result<()>;

    /// Discards the session's writes and releases its locks.
    fn rollback(&self, handle: SessionHandle) -> Result<()>;

    /// Reads one field of a row. With `lock` set, the row's exclusive lock is
    /// taken first and held until the session ends.
    fn read_field(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        lock: bool,
    ) -> Result<Datum>;

    /// Adds `delta` to the field if `guard` holds for the value current at
    /// update time. Returns the number of rows affected (0 or 1).
    fn conditional_update(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        delta: &Datum,
        guard: &Guard,
    ) -> Result<u64>;

    /// Assigns a field unconditionally. Returns the number of rows affected.
    fn write_field(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        value: Datum,
    ) -> Result<u64>;

    /// Creates the row if missing and assigns all given fields.
    fn upsert_entity(&self, handle: SessionHandle, entity: &EntityKey, fields: Fields) -> Result<()>;

    /// Appends an audit/booking record.
    fn insert_record(&self, handle: SessionHandle, kind: &str, fields: Fields) -> Result<RecordId>;

    /// Counts records matching the filter as visible to the session.
    fn count_matching(&self, handle: SessionHandle, filter: &RecordFilter) -> Result<u64>;

    /// Removes every record of a kind. Returns the number of records removed.
    fn truncate(&self, handle: SessionHandle, kind: &str) -> Result<u64>;
}
