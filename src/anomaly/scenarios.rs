use std::thread;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info};

use crate::anomaly::detection::{
    classify_dirty_read, classify_non_repeatable_read, classify_phantom_read, Detection,
    AFTER_ROLLBACK, BEFORE_WRITE, DURING_WRITE, FIRST_COUNT, FIRST_READ, SECOND_COUNT,
    SECOND_READ,
};
use crate::anomaly::signal::cue;
use crate::anomaly::{AnomalyKind, AnomalyResult, Snapshot, SnapshotLog};
use crate::config::{AnomalyConfig, ScenarioTiming, SyncMode};
use crate::errors::{LabError, Result};
use crate::fixtures::{order_fields, BALANCE, ORDERS, ORDER_STATUS};
use crate::isolation::IsolationLevel;
use crate::session::{OperationResult, TransactionSession};
use crate::storage::{Datum, EntityKey, Guard, RecordFilter};

/// Level every mutator session runs at.
const MUTATOR_LEVEL: IsolationLevel = IsolationLevel::ReadCommitted;

/// What the observer session hands back: its transaction id and the values it
/// read, in order.
type Observed = (u64, Vec<Snapshot>);

/// What the mutator session hands back: its transaction id and rows written.
type Mutated = (u64, u64);

struct PairOutcome {
    observer_id: u64,
    snapshots: Vec<Snapshot>,
    mutated: Option<Mutated>,
    mutator_error: Option<String>,
    started_at: SystemTime,
}

/// Drives an observer and a mutator session against each other to provoke a
/// read anomaly, then classifies what the observer saw.
///
/// Each call performs exactly one run and never retries. The observer runs on
/// the calling thread, the mutator on a scoped thread.
pub struct AnomalyDetector {
    sessions: TransactionSession,
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(sessions: TransactionSession, config: AnomalyConfig) -> Self {
        Self { sessions, config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Offsets for this run. Timed mode rejects offsets that cannot
    /// interleave the two sessions.
    fn timing(&self) -> Result<ScenarioTiming> {
        match &self.config.sync {
            SyncMode::Timed(timing) => {
                timing.validate()?;
                Ok(timing.clone())
            }
            SyncMode::Rendezvous => Ok(ScenarioTiming::default()),
        }
    }

    fn deadline(&self) -> (Instant, Duration) {
        let limit = self.config.scenario_timeout;
        (Instant::now() + limit, limit)
    }

    /// Mutator adds `dirty_write_amount` to the balance, holds the write open,
    /// then rolls back. The observer reads the balance before, during and
    /// after.
    pub fn dirty_read(
        &self,
        account: &EntityKey,
        observer_level: IsolationLevel,
    ) -> Result<AnomalyResult> {
        info!("Provoking dirty read on {} at {}", account, observer_level);
        let timing = self.timing()?;
        let sync = &self.config.sync;
        let (deadline, limit) = self.deadline();
        let amount = self.config.dirty_write_amount;

        let (baseline_cue, baseline_wait) = cue("baseline read", sync, timing.writer_delay);
        let (written_cue, written_wait) = cue("write applied", sync, timing.observer_pause);
        let (observed_cue, observed_wait) = cue("dirty value read", sync, timing.writer_hold);
        let (rolled_back_cue, rolled_back_wait) = cue("write rolled back", sync, timing.writer_hold);

        let mutator = move || {
            let result = self.sessions.run(MUTATOR_LEVEL, |scope| {
                baseline_wait.wait(deadline, limit)?;
                scope.conditional_update(account, BALANCE, amount, &Guard::Always)?;
                debug!("Mutator {} wrote +{:.2} to {} (uncommitted)", scope.transaction_id(), amount, account);
                written_cue.give();
                observed_wait.wait(deadline, limit)?;
                scope.rollback_only();
                Ok((scope.transaction_id(), 1))
            });
            rolled_back_cue.give();
            result
        };

        let observer = || {
            self.sessions.read_only(true).run(observer_level, |scope| {
                let mut log = SnapshotLog::default();
                log.capture(BEFORE_WRITE, scope.read(account, BALANCE)?);
                baseline_cue.give();
                written_wait.wait(deadline, limit)?;
                log.capture(DURING_WRITE, scope.read(account, BALANCE)?);
                observed_cue.give();
                rolled_back_wait.wait(deadline, limit)?;
                log.capture(AFTER_ROLLBACK, scope.read(account, BALANCE)?);
                Ok((scope.transaction_id(), log.into_inner()))
            })
        };

        let outcome = run_pair(mutator, observer)?;
        let detection = classify_dirty_read(&outcome.snapshots)?;
        Ok(finish(AnomalyKind::DirtyRead, observer_level, outcome, detection, None))
    }

    /// Observer reads the balance twice; in between the mutator commits an
    /// update of `committed_update_amount`.
    pub fn non_repeatable_read(
        &self,
        account: &EntityKey,
        observer_level: IsolationLevel,
    ) -> Result<AnomalyResult> {
        info!("Provoking non-repeatable read on {} at {}", account, observer_level);
        let timing = self.timing()?;
        let sync = &self.config.sync;
        let (deadline, limit) = self.deadline();
        let amount = self.config.committed_update_amount;

        let (first_read_cue, first_read_wait) = cue("first read", sync, timing.writer_delay);
        let (committed_cue, committed_wait) = cue("update committed", sync, timing.observer_pause);

        let mutator = move || {
            let result = self.sessions.run(MUTATOR_LEVEL, |scope| {
                first_read_wait.wait(deadline, limit)?;
                let rows = scope.conditional_update(account, BALANCE, amount, &Guard::Always)?;
                Ok((scope.transaction_id(), rows))
            });
            committed_cue.give();
            result
        };

        let observer = || {
            self.sessions.read_only(true).run(observer_level, |scope| {
                let mut log = SnapshotLog::default();
                log.capture(FIRST_READ, scope.read(account, BALANCE)?);
                first_read_cue.give();
                committed_wait.wait(deadline, limit)?;
                log.capture(SECOND_READ, scope.read(account, BALANCE)?);
                Ok((scope.transaction_id(), log.into_inner()))
            })
        };

        let outcome = run_pair(mutator, observer)?;
        let detection = classify_non_repeatable_read(&outcome.snapshots)?;
        Ok(finish(
            AnomalyKind::NonRepeatableRead,
            observer_level,
            outcome,
            detection,
            None,
        ))
    }

    /// Observer counts orders with the given status twice; in between the
    /// mutator inserts `phantom_rows` matching orders and commits.
    pub fn phantom_read(&self, status: &str, observer_level: IsolationLevel) -> Result<AnomalyResult> {
        info!("Provoking phantom read on '{}' orders at {}", status, observer_level);
        let timing = self.timing()?;
        let sync = &self.config.sync;
        let (deadline, limit) = self.deadline();
        let rows = self.config.phantom_rows;
        let user_id = self.config.phantom_user_id;
        let total = self.config.phantom_order_amount;
        let filter = RecordFilter::new(ORDERS, ORDER_STATUS, status);

        let (first_count_cue, first_count_wait) = cue("first count", sync, timing.writer_delay);
        let (committed_cue, committed_wait) = cue("inserts committed", sync, timing.observer_pause);

        let mutator = move || {
            let result = self.sessions.run(MUTATOR_LEVEL, |scope| {
                first_count_wait.wait(deadline, limit)?;
                for _ in 0..rows {
                    scope.insert_record(ORDERS, order_fields(user_id, total, status))?;
                }
                Ok((scope.transaction_id(), u64::from(rows)))
            });
            committed_cue.give();
            result
        };

        let observer = || {
            self.sessions.read_only(true).run(observer_level, |scope| {
                let mut log = SnapshotLog::default();
                log.capture(FIRST_COUNT, Datum::Int(scope.count_matching(&filter)? as i64));
                first_count_cue.give();
                committed_wait.wait(deadline, limit)?;
                log.capture(SECOND_COUNT, Datum::Int(scope.count_matching(&filter)? as i64));
                Ok((scope.transaction_id(), log.into_inner()))
            })
        };

        let outcome = run_pair(mutator, observer)?;
        let rows_inserted = outcome.mutated.map(|(_, rows)| rows).unwrap_or(0);
        let detection = classify_phantom_read(&outcome.snapshots, rows_inserted)?;
        Ok(finish(
            AnomalyKind::PhantomRead,
            observer_level,
            outcome,
            detection,
            Some(rows_inserted),
        ))
    }
}

/// Runs the mutator on a scoped thread and the observer on this one.
///
/// The observer's failure fails the run. The mutator's failure is recorded;
/// the observer still finishes because dropped cues release it.
fn run_pair<M, O>(mutator: M, observer: O) -> Result<PairOutcome>
where
    M: FnOnce() -> Result<OperationResult<Mutated>> + Send,
    O: FnOnce() -> Result<OperationResult<Observed>>,
{
    let started_at = SystemTime::now();
    let (observed, joined) = thread::scope(|s| {
        let handle = s.spawn(mutator);
        let observed = observer();
        (observed, handle.join())
    });

    let observed = observed?;
    let (observer_id, snapshots) = match observed.value {
        Some(value) => value,
        None => {
            return Err(observed.error.unwrap_or_else(|| {
                LabError::Other(format!(
                    "observer session failed: {}",
                    observed.error_message.unwrap_or_default()
                ))
            }));
        }
    };

    let (mutated, mutator_error) = match joined {
        Ok(Ok(result)) if result.success => (result.value, None),
        Ok(Ok(result)) => (None, result.error_message),
        Ok(Err(e)) => (None, Some(e.to_string())),
        Err(_) => (None, Some("mutator thread panicked".to_string())),
    };
    if let Some(e) = &mutator_error {
        debug!("Mutator session failed: {}", e);
    }

    Ok(PairOutcome {
        observer_id,
        snapshots,
        mutated,
        mutator_error,
        started_at,
    })
}

fn finish(
    kind: AnomalyKind,
    observer_level: IsolationLevel,
    outcome: PairOutcome,
    detection: Detection,
    rows_inserted: Option<u64>,
) -> AnomalyResult {
    if detection.detected {
        info!("{} detected at {}: {}", kind, observer_level, detection.evidence);
    } else {
        info!("No {} at {}: {}", kind, observer_level, detection.evidence);
    }

    let evidence = match &outcome.mutator_error {
        Some(e) => format!("{} (mutator failed: {})", detection.evidence, e),
        None => detection.evidence,
    };

    AnomalyResult {
        kind,
        observer_id: outcome.observer_id,
        mutator_id: outcome.mutated.map(|(id, _)| id),
        isolation_level: observer_level,
        mutator_level: MUTATOR_LEVEL,
        snapshots: outcome.snapshots,
        detected: detection.detected,
        evidence,
        delta: detection.delta,
        rows_inserted,
        mutator_error: outcome.mutator_error,
        started_at: outcome.started_at,
        finished_at: SystemTime::now(),
    }
}
