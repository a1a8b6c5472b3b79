use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LabError, Result};

/// How the two sessions of an anomaly scenario line up their steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Each step waits for an explicit signal from the peer session, sent
    /// right after the peer's write, commit or rollback has returned.
    #[default]
    Rendezvous,
    /// Each step sleeps for a fixed offset instead. Use with collaborators
    /// whose commit events cannot be observed from the caller's side.
    Timed(ScenarioTiming),
}

/// Offsets used by [`SyncMode::Timed`]. They must exceed the collaborator's
/// round trip, and the observer's second read must land while the mutator's
/// write is open: `writer_delay < observer_pause < writer_delay + writer_hold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTiming {
    /// Mutator waits this long before its write.
    pub writer_delay: Duration,
    /// Observer waits this long between its first and second read.
    pub observer_pause: Duration,
    /// Mutator keeps an uncommitted write open this long.
    pub writer_hold: Duration,
}

impl ScenarioTiming {
    /// Rejects offsets under which the observer cannot see the mutator's
    /// write in time.
    pub fn validate(&self) -> Result<()> {
        if self.observer_pause <= self.writer_delay {
            return Err(LabError::InvalidInput(format!(
                "observer_pause {:?} must exceed writer_delay {:?}",
                self.observer_pause, self.writer_delay
            )));
        }
        let write_closes = self.writer_delay.saturating_add(self.writer_hold);
        if self.observer_pause >= write_closes {
            return Err(LabError::InvalidInput(format!(
                "observer_pause {:?} must fall before writer_delay + writer_hold {:?}",
                self.observer_pause, write_closes
            )));
        }
        Ok(())
    }
}

impl Default for ScenarioTiming {
    fn default() -> Self {
        Self {
            writer_delay: Duration::from_millis(200),
            observer_pause: Duration::from_millis(400),
            writer_hold: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub sync: SyncMode,
    /// Upper bound on any single wait inside a scenario.
    pub scenario_timeout: Duration,
    /// Amount the dirty-read mutator adds and then rolls back.
    pub dirty_write_amount: f64,
    /// Amount the non-repeatable-read mutator adds and commits.
    pub committed_update_amount: f64,
    /// Rows the phantom-read mutator inserts.
    pub phantom_rows: u32,
    /// Requester id stamped on phantom orders.
    pub phantom_user_id: i64,
    pub phantom_order_amount: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sync: SyncMode::default(),
            scenario_timeout: Duration::from_secs(10),
            dirty_write_amount: 1000.0,
            committed_update_amount: 500.0,
            phantom_rows: 1,
            phantom_user_id: 999,
            phantom_order_amount: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    /// When false the stock read never takes the row lock, whatever the
    /// isolation level.
    pub lock_rows_on_read: bool,
    /// Per-booking session deadline.
    pub session_timeout: Option<Duration>,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            lock_rows_on_read: true,
            session_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Product whose stock the workers contend for.
    pub resource_id: u64,
    /// Stock the product is reset to before each run.
    pub initial_stock: i64,
    pub min_quantity: i64,
    pub max_quantity: i64,
    /// Deadline for the whole run, measured from the first job.
    pub deadline: Duration,
    /// Seed for requested quantities. Unseeded runs draw from OS entropy.
    pub seed: Option<u64>,
    /// Workers and operations used by the per-level comparison.
    pub comparison_workers: usize,
    pub comparison_operations: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            resource_id: 1,
            initial_stock: 10,
            min_quantity: 1,
            max_quantity: 3,
            deadline: Duration::from_secs(60),
            seed: None,
            comparison_workers: 10,
            comparison_operations: 100,
        }
    }
}

/// Top-level configuration of an [`IsolationLab`](crate::IsolationLab).
///
/// Deserialize it with any serde format; every section has defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub anomaly: AnomalyConfig,
    pub booking: BookingConfig,
    pub simulation: SimulationConfig,
}
