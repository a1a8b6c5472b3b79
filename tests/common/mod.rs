//! Common utilities for isolab integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use isolab::storage::{Fields, RecordId, SessionHandle};
use isolab::{
    Datum, EntityKey, Guard, IsolationLab, IsolationLevel, LabConfig, LabError, MemoryStorage,
    MemoryStorageConfig, RecordFilter, Result, Storage, TransactionSession,
};
use parking_lot::Mutex;

/// Lock waits short enough that lock-timeout tests finish quickly.
pub fn fast_storage_config() -> MemoryStorageConfig {
    MemoryStorageConfig {
        lock_wait_timeout: Duration::from_millis(300),
        ..MemoryStorageConfig::default()
    }
}

/// A memory store loaded with the fixture accounts, products and orders.
pub fn seeded_storage() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::with_config(fast_storage_config()));
    let sessions = TransactionSession::new(storage.clone());
    isolab::fixtures::seed(&sessions).unwrap();
    storage
}

/// Helper function to create a lab over a freshly seeded memory store.
pub fn setup_lab(config: LabConfig) -> (IsolationLab, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::with_config(fast_storage_config()));
    let lab = IsolationLab::new(storage.clone(), config);
    lab.reset_test_data().unwrap();
    (lab, storage)
}

pub fn balance(storage: &MemoryStorage, account_id: u64) -> f64 {
    storage
        .committed_value(&isolab::fixtures::account(account_id), isolab::fixtures::BALANCE)
        .unwrap()
        .as_f64()
        .unwrap()
}

pub fn stock(storage: &MemoryStorage, product_id: u64) -> i64 {
    storage
        .committed_value(
            &isolab::fixtures::product(product_id),
            isolab::fixtures::AVAILABLE_QUANTITY,
        )
        .unwrap()
        .as_i64()
        .unwrap()
}

// --- FaultyStorage ---

/// Wraps a [`MemoryStorage`] and fails every conditional update with a
/// chosen error while one is armed. It can also answer unlocked reads with a
/// stale value, which makes a booking lose its race deterministically.
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    update_error: Mutex<Option<LabError>>,
    stale_read: Mutex<Option<Datum>>,
}

impl FaultyStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            update_error: Mutex::new(None),
            stale_read: Mutex::new(None),
        }
    }

    pub fn stale_reads_with(&self, value: Datum) {
        *self.stale_read.lock() = Some(value);
    }

    pub fn fail_updates_with(&self, error: LabError) {
        *self.update_error.lock() = Some(error);
    }
}

impl Storage for FaultyStorage {
    fn begin_session(&self, level: IsolationLevel) -> Result<SessionHandle> {
        self.inner.begin_session(level)
    }

    fn commit(&self, handle: SessionHandle) -> Result<()> {
        self.inner.commit(handle)
    }

    fn rollback(&self, handle: SessionHandle) -> Result<()> {
        self.inner.rollback(handle)
    }

    fn read_field(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        lock: bool,
    ) -> Result<Datum> {
        let actual = self.inner.read_field(handle, entity, field, lock)?;
        match self.stale_read.lock().clone() {
            Some(stale) if !lock => Ok(stale),
            _ => Ok(actual),
        }
    }

    fn conditional_update(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        delta: &Datum,
        guard: &Guard,
    ) -> Result<u64> {
        if let Some(e) = self.update_error.lock().clone() {
            return Err(e);
        }
        self.inner.conditional_update(handle, entity, field, delta, guard)
    }

    fn write_field(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        value: Datum,
    ) -> Result<u64> {
        self.inner.write_field(handle, entity, field, value)
    }

    fn upsert_entity(&self, handle: SessionHandle, entity: &EntityKey, fields: Fields) -> Result<()> {
        self.inner.upsert_entity(handle, entity, fields)
    }

    fn insert_record(&self, handle: SessionHandle, kind: &str, fields: Fields) -> Result<RecordId> {
        self.inner.insert_record(handle, kind, fields)
    }

    fn count_matching(&self, handle: SessionHandle, filter: &RecordFilter) -> Result<u64> {
        self.inner.count_matching(handle, filter)
    }

    fn truncate(&self, handle: SessionHandle, kind: &str) -> Result<u64> {
        self.inner.truncate(handle, kind)
    }
}

/// A seeded [`FaultyStorage`] with nothing armed yet.
pub fn seeded_faulty_storage() -> Arc<FaultyStorage> {
    let storage = Arc::new(FaultyStorage::new(MemoryStorage::with_config(
        fast_storage_config(),
    )));
    let sessions = TransactionSession::new(storage.clone());
    isolab::fixtures::seed(&sessions).unwrap();
    storage
}
