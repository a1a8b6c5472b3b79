use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{LabError, Result};
use crate::isolation::IsolationLevel;
use crate::storage::{Datum, EntityKey, Fields, Guard, RecordFilter, RecordId, SessionHandle, Storage};

/// Shared flag that asks in-flight sessions to stop issuing calls.
///
/// Cancellation is cooperative: a session notices it at its next collaborator
/// call, fails that call with [`LabError::Cancelled`] and still rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a [`TransactionContext`]. Leaves `Active` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    /// Rolled back because the operation, the commit or the deadline failed.
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

/// Bookkeeping for one logical transaction.
///
/// Only the owning session mutates it, and only until it is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    id: u64,
    session_id: u64,
    isolation_level: IsolationLevel,
    read_only: bool,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    status: TransactionStatus,
    duration_millis: Option<u64>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl TransactionContext {
    fn new(id: u64, handle: SessionHandle, isolation_level: IsolationLevel, read_only: bool) -> Self {
        Self {
            id,
            session_id: handle.id(),
            isolation_level,
            read_only,
            start_time: SystemTime::now(),
            end_time: None,
            status: TransactionStatus::Active,
            duration_millis: None,
            started: Some(Instant::now()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn duration_millis(&self) -> Option<u64> {
        self.duration_millis
    }

    fn finalize(&mut self, status: TransactionStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LabError::InvalidState(format!(
                "transaction {} already finished as {:?}",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(LabError::InvalidState(
                "a transaction cannot be finalized as active".to_string(),
            ));
        }
        self.status = status;
        self.end_time = Some(SystemTime::now());
        self.duration_millis = self.started.map(|s| s.elapsed().as_millis() as u64);
        Ok(())
    }
}

/// Outcome of one unit of work run through [`TransactionSession::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub operation_id: String,
    pub success: bool,
    /// Final status of the underlying transaction.
    pub status: TransactionStatus,
    pub execution_time: SystemTime,
    pub duration_millis: u64,
    pub error_message: Option<String>,
    /// Always zero: the core never retries.
    pub retry_count: u32,
    /// What the operation returned, if it succeeded.
    pub value: Option<T>,
    #[serde(skip)]
    pub error: Option<LabError>,
}

impl<T> OperationResult<T> {
    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().is_some_and(LabError::is_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Commit,
    Rollback,
    /// Roll back after a failure.
    Abort,
}

/// A session opened with [`TransactionSession::begin`] and driven by hand.
///
/// Ends with [`ActiveSession::commit`] or [`ActiveSession::rollback`]. A
/// session dropped while still active (early return, panic) rolls back.
pub struct ActiveSession {
    storage: Arc<dyn Storage>,
    handle: SessionHandle,
    context: TransactionContext,
    deadline: Option<(Instant, Duration)>,
    cancellation: Option<CancellationToken>,
    rollback_only: bool,
}

impl ActiveSession {
    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Borrows the collaborator handle bound to this session.
    pub fn scope(&mut self) -> SessionScope<'_> {
        SessionScope { session: self }
    }

    /// Commits, or rolls back if the session was marked rollback-only.
    pub fn commit(mut self) -> Result<TransactionContext> {
        let terminal = if self.rollback_only {
            Terminal::Rollback
        } else {
            Terminal::Commit
        };
        self.terminate(terminal)?;
        Ok(self.context.clone())
    }

    pub fn rollback(mut self) -> Result<TransactionContext> {
        self.terminate(Terminal::Rollback)?;
        Ok(self.context.clone())
    }

    fn deadline_error(&self) -> Option<LabError> {
        self.deadline
            .filter(|(deadline, _)| Instant::now() >= *deadline)
            .map(|(_, limit)| LabError::Timeout(limit))
    }

    fn terminate(&mut self, terminal: Terminal) -> Result<()> {
        if self.context.status.is_terminal() {
            return Err(LabError::InvalidState(format!(
                "transaction {} already finished",
                self.context.id
            )));
        }

        let (status, result) = match terminal {
            Terminal::Commit => match self.storage.commit(self.handle) {
                Ok(()) => (TransactionStatus::Committed, Ok(())),
                Err(e) => {
                    // The collaborator may still hold the session open.
                    if let Err(rollback_error) = self.storage.rollback(self.handle) {
                        debug!(
                            "Rollback after failed commit of transaction {}: {}",
                            self.context.id, rollback_error
                        );
                    }
                    (TransactionStatus::Failed, Err(e))
                }
            },
            Terminal::Rollback => match self.storage.rollback(self.handle) {
                Ok(()) => (TransactionStatus::RolledBack, Ok(())),
                Err(e) => (TransactionStatus::Failed, Err(e)),
            },
            Terminal::Abort => (TransactionStatus::Failed, self.storage.rollback(self.handle)),
        };

        self.context.finalize(status)?;
        debug!(
            "Transaction {} (session {}, {}) finished as {:?} in {:?} ms",
            self.context.id,
            self.context.session_id,
            self.context.isolation_level,
            status,
            self.context.duration_millis
        );
        result
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if !self.context.status.is_terminal() {
            warn!(
                "Transaction {} dropped while active, rolling back",
                self.context.id
            );
            if let Err(e) = self.terminate(Terminal::Abort) {
                warn!("Rollback of dropped transaction {} failed: {}", self.context.id, e);
            }
        }
    }
}

/// Collaborator handle bound to one open session.
///
/// Every call first checks the session deadline and cancellation token.
pub struct SessionScope<'a> {
    session: &'a mut ActiveSession,
}

impl SessionScope<'_> {
    pub fn isolation_level(&self) -> IsolationLevel {
        self.session.context.isolation_level
    }

    pub fn transaction_id(&self) -> u64 {
        self.session.context.id
    }

    /// Ends the session with a rollback even if the operation returns `Ok`.
    pub fn rollback_only(&mut self) {
        self.session.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.session.rollback_only
    }

    pub fn read(&mut self, entity: &EntityKey, field: &str) -> Result<Datum> {
        self.checkpoint()?;
        let s = &self.session;
        s.storage.read_field(s.handle, entity, field, false)
    }

    /// Reads while taking the row's exclusive lock.
    pub fn read_for_update(&mut self, entity: &EntityKey, field: &str) -> Result<Datum> {
        self.checkpoint()?;
        let s = &self.session;
        s.storage.read_field(s.handle, entity, field, true)
    }

    pub fn conditional_update(
        &mut self,
        entity: &EntityKey,
        field: &str,
        delta: impl Into<Datum>,
        guard: &Guard,
    ) -> Result<u64> {
        self.writable_checkpoint()?;
        let s = &self.session;
        s.storage
            .conditional_update(s.handle, entity, field, &delta.into(), guard)
    }

    pub fn write_field(&mut self, entity: &EntityKey, field: &str, value: impl Into<Datum>) -> Result<u64> {
        self.writable_checkpoint()?;
        let s = &self.session;
        s.storage.write_field(s.handle, entity, field, value.into())
    }

    pub fn upsert_entity(&mut self, entity: &EntityKey, fields: Fields) -> Result<()> {
        self.writable_checkpoint()?;
        let s = &self.session;
        s.storage.upsert_entity(s.handle, entity, fields)
    }

    pub fn insert_record(&mut self, kind: &str, fields: Fields) -> Result<RecordId> {
        self.writable_checkpoint()?;
        let s = &self.session;
        s.storage.insert_record(s.handle, kind, fields)
    }

    pub fn count_matching(&mut self, filter: &RecordFilter) -> Result<u64> {
        self.checkpoint()?;
        let s = &self.session;
        s.storage.count_matching(s.handle, filter)
    }

    pub fn truncate(&mut self, kind: &str) -> Result<u64> {
        self.writable_checkpoint()?;
        let s = &self.session;
        s.storage.truncate(s.handle, kind)
    }

    fn checkpoint(&self) -> Result<()> {
        if self
            .session
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(LabError::Cancelled);
        }
        match self.session.deadline_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn writable_checkpoint(&self) -> Result<()> {
        if self.session.context.read_only {
            return Err(LabError::InvalidState(format!(
                "transaction {} is read-only",
                self.session.context.id
            )));
        }
        self.checkpoint()
    }
}

/// Runs units of work inside collaborator sessions.
///
/// Cheap to clone; clones share the transaction id counter.
#[derive(Clone)]
pub struct TransactionSession {
    storage: Arc<dyn Storage>,
    transaction_counter: Arc<AtomicU64>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    read_only: bool,
}

impl TransactionSession {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            transaction_counter: Arc::new(AtomicU64::new(0)),
            timeout: None,
            cancellation: None,
            read_only: false,
        }
    }

    /// Sessions begun from the returned runner fail with
    /// [`LabError::Timeout`] once they run longer than `timeout`.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..self.clone()
        }
    }

    pub fn read_only(&self, read_only: bool) -> Self {
        Self {
            read_only,
            ..self.clone()
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Opens a session for manual control.
    ///
    /// # Errors
    ///
    /// Fails when the collaborator cannot open a session.
    pub fn begin(&self, level: IsolationLevel) -> Result<ActiveSession> {
        let handle = self.storage.begin_session(level)?;
        let id = self.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ActiveSession {
            storage: Arc::clone(&self.storage),
            handle,
            context: TransactionContext::new(id, handle, level, self.read_only),
            deadline: self.timeout.map(|limit| (Instant::now() + limit, limit)),
            cancellation: self.cancellation.clone(),
            rollback_only: false,
        })
    }

    /// Runs `operation` inside a fresh session at `level`.
    ///
    /// `Ok` from the operation commits (or rolls back when the operation
    /// called [`SessionScope::rollback_only`]). `Err`, a failed commit or an
    /// exceeded deadline rolls back and yields a failed result. Exactly one of
    /// commit or rollback reaches the collaborator on every path.
    ///
    /// # Errors
    ///
    /// Only fatal collaborator failures are returned as `Err`: the session
    /// could not be opened, or the collaborator became unavailable mid-way.
    pub fn run<T, F>(&self, level: IsolationLevel, operation: F) -> Result<OperationResult<T>>
    where
        F: FnOnce(&mut SessionScope<'_>) -> Result<T>,
    {
        let mut session = self.begin(level)?;

        let outcome = operation(&mut session.scope());
        let outcome = match (outcome, session.deadline_error()) {
            (Ok(_), Some(timeout)) => Err(timeout),
            (outcome, _) => outcome,
        };

        let (value, error) = match outcome {
            Ok(value) => {
                let terminal = if session.rollback_only {
                    Terminal::Rollback
                } else {
                    Terminal::Commit
                };
                match session.terminate(terminal) {
                    Ok(()) => (Some(value), None),
                    Err(e) => (None, Some(e)),
                }
            }
            Err(e) => {
                if let Err(rollback_error) = session.terminate(Terminal::Abort) {
                    warn!(
                        "Rollback of transaction {} failed: {}",
                        session.context.id, rollback_error
                    );
                }
                (None, Some(e))
            }
        };

        if let Some(fatal) = error.as_ref().filter(|e| e.is_fatal()) {
            return Err(fatal.clone());
        }

        let context = session.context();
        Ok(OperationResult {
            operation_id: format!("op-{}-{}", context.session_id(), context.id()),
            success: error.is_none(),
            status: context.status(),
            execution_time: context.start_time(),
            duration_millis: context.duration_millis().unwrap_or_default(),
            error_message: error.as_ref().map(ToString::to_string),
            retry_count: 0,
            value,
            error,
        })
    }
}
