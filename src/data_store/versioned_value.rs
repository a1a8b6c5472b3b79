use crate::storage::Datum;

/// Represents a field value with the commit version that produced it.
///
/// Versions are the collaborator's commit timestamps. A snapshot taken at
/// version `v` sees every value committed at or before `v`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    datum: Datum,
    version: u64,
}

impl VersionedValue {
    pub fn new(datum: Datum, version: u64) -> Self {
        Self { datum, version }
    }

    pub fn datum(&self) -> &Datum {
        &self.datum
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Committed history of one field, oldest first.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<VersionedValue>,
}

impl VersionChain {
    /// Latest committed value.
    pub fn latest(&self) -> Option<&VersionedValue> {
        self.versions.last()
    }

    /// Newest value committed at or before `snapshot`.
    pub fn visible_at(&self, snapshot: u64) -> Option<&VersionedValue> {
        self.versions.iter().rev().find(|v| v.version() <= snapshot)
    }

    pub fn push(&mut self, value: VersionedValue) {
        debug_assert!(
            self.latest().is_none_or(|last| last.version() < value.version()),
            "versions must be appended in commit order"
        );
        self.versions.push(value);
    }

    /// Drops history no live snapshot can see any more, keeping at least the
    /// newest value visible at `oldest_snapshot`.
    pub fn prune(&mut self, oldest_snapshot: u64) {
        let keep_from = self
            .versions
            .iter()
            .rposition(|v| v.version() <= oldest_snapshot)
            .unwrap_or(0);
        if keep_from > 0 {
            self.versions.drain(..keep_from);
        }
    }
}
