use std::sync::Arc;

use log::info;

use crate::anomaly::{AnomalyDetector, AnomalyResult};
use crate::booking::{BookingResult, BookingSimulator};
use crate::config::LabConfig;
use crate::errors::Result;
use crate::fixtures::{self, account};
use crate::isolation::IsolationLevel;
use crate::report::IsolationComparison;
use crate::session::TransactionSession;
use crate::simulation::{LoadSimulator, SimulationSummary};
use crate::storage::Storage;
use crate::transfer::{BrokenTransferResult, ConsistencyCheck, TransferResult, TransferService};

/// Isolab Prelude
pub mod prelude {
    pub use crate::anomaly::*;
    pub use crate::booking::*;
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::isolation::*;
    pub use crate::report::*;
    pub use crate::session::*;
    pub use crate::simulation::*;
    pub use crate::storage::*;
    pub use crate::transfer::*;
    pub use crate::*;
}

/// The main entry point: every demonstration and simulation the lab offers,
/// wired to one storage collaborator.
pub struct IsolationLab {
    /// Shared session runner; every component draws transaction ids from it.
    sessions: TransactionSession,
    detector: AnomalyDetector,
    booking: BookingSimulator,
    simulator: LoadSimulator,
    transfers: TransferService,
    config: LabConfig,
}

impl IsolationLab {
    pub fn new(storage: Arc<dyn Storage>, config: LabConfig) -> Self {
        let sessions = TransactionSession::new(storage);
        let detector = AnomalyDetector::new(sessions.clone(), config.anomaly.clone());
        let booking = BookingSimulator::new(sessions.clone(), config.booking.clone());
        let simulator = LoadSimulator::new(
            booking.clone(),
            sessions.clone(),
            config.simulation.clone(),
        );
        let transfers = TransferService::new(sessions.clone());
        Self {
            sessions,
            detector,
            booking,
            simulator,
            transfers,
            config,
        }
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn sessions(&self) -> &TransactionSession {
        &self.sessions
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn booking(&self) -> &BookingSimulator {
        &self.booking
    }

    pub fn simulator(&self) -> &LoadSimulator {
        &self.simulator
    }

    pub fn transfers(&self) -> &TransferService {
        &self.transfers
    }

    /// Restores the fixture accounts, products and orders and clears all
    /// bookings.
    pub fn reset_test_data(&self) -> Result<()> {
        fixtures::seed(&self.sessions)?;
        info!("Test data reset");
        Ok(())
    }

    /// Observer at READ UNCOMMITTED watches a write that gets rolled back.
    pub fn demonstrate_dirty_reads(&self, account_id: u64) -> Result<AnomalyResult> {
        self.detector
            .dirty_read(&account(account_id), IsolationLevel::ReadUncommitted)
    }

    /// Observer at READ COMMITTED reads the same balance around a committed
    /// update.
    pub fn demonstrate_non_repeatable_reads(&self, account_id: u64) -> Result<AnomalyResult> {
        self.detector
            .non_repeatable_read(&account(account_id), IsolationLevel::ReadCommitted)
    }

    /// Observer at READ COMMITTED counts orders around a committed insert.
    pub fn demonstrate_phantom_reads(&self, status: &str) -> Result<AnomalyResult> {
        self.detector
            .phantom_read(status, IsolationLevel::ReadCommitted)
    }

    /// Books one product. Unknown level names fall back to READ COMMITTED.
    pub fn perform_concurrent_booking(
        &self,
        product_id: u64,
        user_id: u64,
        quantity: i64,
        isolation_level: &str,
    ) -> BookingResult {
        let level = IsolationLevel::parse_or_default(isolation_level);
        self.booking.book(product_id, user_id, quantity, level)
    }

    /// Runs `operation_count` bookings on `concurrent_users` threads. Unknown
    /// level names fall back to READ COMMITTED.
    pub fn simulate_high_concurrency(
        &self,
        concurrent_users: usize,
        operation_count: usize,
        isolation_level: &str,
    ) -> Result<SimulationSummary> {
        let level = IsolationLevel::parse_or_default(isolation_level);
        self.simulator
            .simulate(concurrent_users, operation_count, level)
    }

    /// Runs the configured comparison workload once per isolation level.
    pub fn compare_isolation_levels(&self) -> Result<IsolationComparison> {
        let simulation = &self.config.simulation;
        self.simulator
            .compare_isolation_levels(simulation.comparison_workers, simulation.comparison_operations)
    }

    /// Atomic transfer at READ COMMITTED. A rejected transfer leaves both
    /// balances untouched.
    pub fn transfer_money(
        &self,
        from_account_id: u64,
        to_account_id: u64,
        amount: f64,
        description: &str,
    ) -> Result<TransferResult> {
        self.transfers.transfer(
            from_account_id,
            to_account_id,
            amount,
            description,
            IsolationLevel::ReadCommitted,
        )
    }

    /// Debits the sender without crediting the receiver. Call
    /// [`reset_test_data`](Self::reset_test_data) afterwards.
    pub fn demonstrate_broken_atomicity(
        &self,
        from_account_id: u64,
        to_account_id: u64,
        amount: f64,
    ) -> Result<BrokenTransferResult> {
        self.transfers
            .broken_transfer(from_account_id, to_account_id, amount)
    }

    /// Attempts to add `amount` (usually negative) to a balance and reports
    /// which rule, if any, refused it. Nothing is committed.
    pub fn demonstrate_consistency_violation(
        &self,
        account_id: u64,
        amount: f64,
    ) -> Result<ConsistencyCheck> {
        self.transfers.check_consistency(account_id, amount)
    }

    pub fn account_balance(&self, account_id: u64) -> Result<f64> {
        self.transfers.balance(account_id)
    }
}
