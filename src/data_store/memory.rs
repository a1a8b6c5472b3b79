use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::data_store::txn_buffer::{FieldKey, PendingRecord, TxnBuffer};
use crate::data_store::versioned_value::{VersionChain, VersionedValue};
use crate::errors::{LabError, Result};
use crate::isolation::IsolationLevel;
use crate::storage::{
    Datum, EntityKey, Fields, Guard, RecordFilter, RecordId, SessionHandle, Storage,
};

/// Tuning knobs of [`MemoryStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    /// How long a session waits for another session's row lock before the
    /// call fails with [`LabError::Deadlock`].
    pub lock_wait_timeout: Duration,
    /// Simulated network round trip added to every call. Widens race windows.
    pub round_trip_latency: Duration,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(2),
            round_trip_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    id: RecordId,
    kind: String,
    fields: Fields,
    version: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Version of the latest commit.
    clock: u64,
    fields: HashMap<FieldKey, VersionChain>,
    records: Vec<StoredRecord>,
    sessions: HashMap<u64, TxnBuffer>,
    /// Row lock table: row to owning session.
    row_locks: HashMap<EntityKey, u64>,
}

impl StoreState {
    fn buffer(&self, handle: SessionHandle) -> Result<&TxnBuffer> {
        self.sessions
            .get(&handle.id())
            .ok_or_else(|| LabError::InvalidState(format!("unknown session {}", handle.id())))
    }

    fn buffer_mut(&mut self, handle: SessionHandle) -> Result<&mut TxnBuffer> {
        self.sessions
            .get_mut(&handle.id())
            .ok_or_else(|| LabError::InvalidState(format!("unknown session {}", handle.id())))
    }

    /// Version the current statement reads at. Snapshot levels pin it on the
    /// first statement; weaker levels read the latest commit.
    fn statement_version(&mut self, handle: SessionHandle) -> Result<u64> {
        let clock = self.clock;
        let buffer = self.buffer_mut(handle)?;
        if buffer.uses_snapshot() {
            Ok(*buffer.snapshot.get_or_insert(clock))
        } else {
            Ok(clock)
        }
    }

    /// First-updater-wins: a snapshot session may not touch a row another
    /// session committed to after the snapshot was taken.
    fn check_write_conflict(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        read_version: u64,
    ) -> Result<()> {
        if !self.buffer(handle)?.uses_snapshot() {
            return Ok(());
        }
        let conflicting = self.fields.iter().any(|((row, _), chain)| {
            row == entity && chain.latest().is_some_and(|v| v.version() > read_version)
        });
        if conflicting {
            return Err(LabError::SerializationFailure(entity.to_string()));
        }
        Ok(())
    }

    fn visible_value(
        &self,
        handle: SessionHandle,
        key: &FieldKey,
        read_version: u64,
    ) -> Result<Datum> {
        let buffer = self.buffer(handle)?;
        if let Some(own) = buffer.writes.get(key) {
            return Ok(own.clone());
        }

        if buffer.level == IsolationLevel::ReadUncommitted {
            // Only the lock holder can have written the row.
            let dirty = self
                .row_locks
                .get(&key.0)
                .filter(|owner| **owner != handle.id())
                .and_then(|owner| self.sessions.get(owner))
                .and_then(|writer| writer.writes.get(key));
            if let Some(value) = dirty {
                return Ok(value.clone());
            }
        }

        let chain = self.fields.get(key).ok_or_else(|| not_found(key))?;
        let visible = if buffer.uses_snapshot() {
            chain.visible_at(read_version)
        } else {
            chain.latest()
        };
        visible.map(|v| v.datum().clone()).ok_or_else(|| not_found(key))
    }

    /// Value a write applies to: the session's own write, else the latest
    /// commit. Callers hold the row lock.
    fn current_value(&self, handle: SessionHandle, key: &FieldKey) -> Result<Datum> {
        if let Some(own) = self.buffer(handle)?.writes.get(key) {
            return Ok(own.clone());
        }
        self.fields
            .get(key)
            .and_then(VersionChain::latest)
            .map(|v| v.datum().clone())
            .ok_or_else(|| not_found(key))
    }

    fn release_locks(&mut self, handle: SessionHandle, buffer: &TxnBuffer) {
        for row in &buffer.locks {
            if self.row_locks.get(row) == Some(&handle.id()) {
                self.row_locks.remove(row);
            }
        }
    }

    fn oldest_snapshot(&self) -> u64 {
        self.sessions
            .values()
            .filter_map(|b| b.snapshot)
            .min()
            .unwrap_or(self.clock)
    }
}

fn not_found(key: &FieldKey) -> LabError {
    LabError::NotFound(format!("{}.{}", key.0, key.1))
}

/// An in-memory [`Storage`] that reproduces the isolation effects of a
/// snapshot-based SQL database closely enough to provoke every anomaly the lab
/// demonstrates.
///
/// * `ReadUncommitted` sessions see other sessions' uncommitted writes.
/// * `ReadCommitted` statements read the latest commit.
/// * `RepeatableRead` and `Serializable` sessions read a snapshot pinned by
///   their first statement; writing a row committed after that snapshot fails
///   with [`LabError::SerializationFailure`].
/// * Writes and locking reads take an exclusive row lock held to the end of
///   the session. Waiting longer than
///   [`MemoryStorageConfig::lock_wait_timeout`] fails with
///   [`LabError::Deadlock`].
///
/// `Serializable` adds no checks beyond first-updater-wins, so write skew is
/// not detected.
pub struct MemoryStorage {
    state: Mutex<StoreState>,
    lock_released: Condvar,
    session_counter: AtomicU64,
    record_counter: AtomicU64,
    available: AtomicBool,
    config: MemoryStorageConfig,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_config(MemoryStorageConfig::default())
    }

    pub fn with_config(config: MemoryStorageConfig) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            lock_released: Condvar::new(),
            session_counter: AtomicU64::new(0),
            record_counter: AtomicU64::new(0),
            available: AtomicBool::new(true),
            config,
        }
    }

    pub fn config(&self) -> &MemoryStorageConfig {
        &self.config
    }

    /// Simulates an outage: while unavailable, new sessions cannot be opened.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Latest committed value of a field, bypassing sessions.
    pub fn committed_value(&self, entity: &EntityKey, field: &str) -> Option<Datum> {
        let state = self.state.lock();
        state
            .fields
            .get(&(entity.clone(), field.to_string()))
            .and_then(VersionChain::latest)
            .map(|v| v.datum().clone())
    }

    /// Number of committed records matching the filter, bypassing sessions.
    pub fn committed_count(&self, filter: &RecordFilter) -> usize {
        let state = self.state.lock();
        state
            .records
            .iter()
            .filter(|r| filter.matches(&r.kind, &r.fields))
            .count()
    }

    /// Sessions begun but not yet committed or rolled back.
    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Row locks currently held.
    pub fn held_locks(&self) -> usize {
        self.state.lock().row_locks.len()
    }

    fn round_trip(&self) {
        if !self.config.round_trip_latency.is_zero() {
            thread::sleep(self.config.round_trip_latency);
        }
    }

    fn acquire_row_lock(
        &self,
        state: &mut MutexGuard<'_, StoreState>,
        handle: SessionHandle,
        entity: &EntityKey,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.lock_wait_timeout;
        loop {
            match state.row_locks.get(entity).copied() {
                None => {
                    state.buffer_mut(handle)?.locks.insert(entity.clone());
                    state.row_locks.insert(entity.clone(), handle.id());
                    return Ok(());
                }
                Some(owner) if owner == handle.id() => return Ok(()),
                Some(owner) => {
                    trace!(
                        "Session {} waiting for lock on {} held by session {}",
                        handle.id(),
                        entity,
                        owner
                    );
                    if self.lock_released.wait_until(state, deadline).timed_out()
                        && state
                            .row_locks
                            .get(entity)
                            .is_some_and(|o| *o != handle.id())
                    {
                        debug!(
                            "Session {} gave up waiting for lock on {}",
                            handle.id(),
                            entity
                        );
                        return Err(LabError::Deadlock(entity.to_string()));
                    }
                }
            }
        }
    }

    /// Shared prologue of every row write: pin the statement version, lock the
    /// row, then reject writes a snapshot session is not allowed to make.
    fn prepare_row_write<'a>(
        &'a self,
        handle: SessionHandle,
        entity: &EntityKey,
    ) -> Result<MutexGuard<'a, StoreState>> {
        self.round_trip();
        let mut state = self.state.lock();
        let read_version = state.statement_version(handle)?;
        self.acquire_row_lock(&mut state, handle, entity)?;
        state.check_write_conflict(handle, entity, read_version)?;
        Ok(state)
    }

    fn finish(&self, handle: SessionHandle) -> Result<(MutexGuard<'_, StoreState>, TxnBuffer)> {
        self.round_trip();
        let mut state = self.state.lock();
        let buffer = state
            .sessions
            .remove(&handle.id())
            .ok_or_else(|| LabError::InvalidState(format!("unknown session {}", handle.id())))?;
        Ok((state, buffer))
    }
}

impl Storage for MemoryStorage {
    fn begin_session(&self, level: IsolationLevel) -> Result<SessionHandle> {
        self.round_trip();
        if !self.available.load(Ordering::SeqCst) {
            return Err(LabError::StorageUnavailable(
                "memory storage is offline".to_string(),
            ));
        }
        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().sessions.insert(id, TxnBuffer::new(level));
        trace!("Session {} opened at {}", id, level);
        Ok(SessionHandle(id))
    }

    fn commit(&self, handle: SessionHandle) -> Result<()> {
        let (mut state, buffer) = self.finish(handle)?;
        state.clock += 1;
        let version = state.clock;

        for kind in &buffer.truncated {
            state.records.retain(|r| &r.kind != kind);
        }
        let mut written = Vec::with_capacity(buffer.writes.len());
        for (key, datum) in &buffer.writes {
            state
                .fields
                .entry(key.clone())
                .or_default()
                .push(VersionedValue::new(datum.clone(), version));
            written.push(key.clone());
        }
        for pending in &buffer.inserts {
            state.records.push(StoredRecord {
                id: pending.id,
                kind: pending.kind.clone(),
                fields: pending.fields.clone(),
                version,
            });
        }

        state.release_locks(handle, &buffer);
        let oldest = state.oldest_snapshot();
        for key in &written {
            if let Some(chain) = state.fields.get_mut(key) {
                chain.prune(oldest);
            }
        }
        drop(state);
        self.lock_released.notify_all();

        debug!(
            "Session {} committed at version {} ({} writes, {} inserts)",
            handle.id(),
            version,
            buffer.writes.len(),
            buffer.inserts.len()
        );
        Ok(())
    }

    fn rollback(&self, handle: SessionHandle) -> Result<()> {
        let (mut state, buffer) = self.finish(handle)?;
        state.release_locks(handle, &buffer);
        drop(state);
        self.lock_released.notify_all();
        debug!(
            "Session {} rolled back ({} writes discarded)",
            handle.id(),
            buffer.writes.len()
        );
        Ok(())
    }

    fn read_field(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        lock: bool,
    ) -> Result<Datum> {
        let key = (entity.clone(), field.to_string());
        if lock {
            let state = self.prepare_row_write(handle, entity)?;
            return state.current_value(handle, &key);
        }
        self.round_trip();
        let mut state = self.state.lock();
        let read_version = state.statement_version(handle)?;
        state.visible_value(handle, &key, read_version)
    }

    fn conditional_update(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        delta: &Datum,
        guard: &Guard,
    ) -> Result<u64> {
        let key = (entity.clone(), field.to_string());
        let mut state = self.prepare_row_write(handle, entity)?;
        let current = state.current_value(handle, &key)?;
        if !guard.holds(&current)? {
            trace!(
                "Session {}: guard {:?} failed on {}.{} = {}",
                handle.id(),
                guard,
                entity,
                field,
                current
            );
            return Ok(0);
        }
        let updated = current.add(delta)?;
        state.buffer_mut(handle)?.writes.insert(key, updated);
        Ok(1)
    }

    fn write_field(
        &self,
        handle: SessionHandle,
        entity: &EntityKey,
        field: &str,
        value: Datum,
    ) -> Result<u64> {
        let key = (entity.clone(), field.to_string());
        let mut state = self.prepare_row_write(handle, entity)?;
        // Existence check; assignment does not depend on the old value.
        state.current_value(handle, &key)?;
        state.buffer_mut(handle)?.writes.insert(key, value);
        Ok(1)
    }

    fn upsert_entity(&self, handle: SessionHandle, entity: &EntityKey, fields: Fields) -> Result<()> {
        let mut state = self.prepare_row_write(handle, entity)?;
        let buffer = state.buffer_mut(handle)?;
        for (field, value) in fields {
            buffer.writes.insert((entity.clone(), field), value);
        }
        Ok(())
    }

    fn insert_record(&self, handle: SessionHandle, kind: &str, fields: Fields) -> Result<RecordId> {
        self.round_trip();
        let mut state = self.state.lock();
        let buffer = state.buffer_mut(handle)?;
        let id = self.record_counter.fetch_add(1, Ordering::SeqCst) + 1;
        buffer.inserts.push(PendingRecord {
            id,
            kind: kind.to_string(),
            fields,
        });
        Ok(id)
    }

    fn count_matching(&self, handle: SessionHandle, filter: &RecordFilter) -> Result<u64> {
        self.round_trip();
        let mut state = self.state.lock();
        let read_version = state.statement_version(handle)?;
        let buffer = state.buffer(handle)?;

        let committed = state
            .records
            .iter()
            .filter(|r| !buffer.truncated.contains(&r.kind))
            .filter(|r| !buffer.uses_snapshot() || r.version <= read_version)
            .filter(|r| filter.matches(&r.kind, &r.fields))
            .count();
        let own = buffer
            .inserts
            .iter()
            .filter(|r| filter.matches(&r.kind, &r.fields))
            .count();
        let dirty = if buffer.level == IsolationLevel::ReadUncommitted {
            state
                .sessions
                .iter()
                .filter(|(id, _)| **id != handle.id())
                .flat_map(|(_, other)| other.inserts.iter())
                .filter(|r| filter.matches(&r.kind, &r.fields))
                .count()
        } else {
            0
        };

        Ok((committed + own + dirty) as u64)
    }

    fn truncate(&self, handle: SessionHandle, kind: &str) -> Result<u64> {
        self.round_trip();
        let mut state = self.state.lock();
        let read_version = state.statement_version(handle)?;
        let snapshot_bound = state.buffer(handle)?.uses_snapshot();
        let visible = state
            .records
            .iter()
            .filter(|r| r.kind == kind)
            .filter(|r| !snapshot_bound || r.version <= read_version)
            .count();
        let buffer = state.buffer_mut(handle)?;
        let before = buffer.inserts.len();
        buffer.inserts.retain(|r| r.kind != kind);
        let own = before - buffer.inserts.len();
        let already_truncated = !buffer.truncated.insert(kind.to_string());
        let removed = if already_truncated { own } else { visible + own };
        Ok(removed as u64)
    }
}
