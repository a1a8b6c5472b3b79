use std::time::SystemTime;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{LabError, Result};
use crate::fixtures::{
    account, fields, BALANCE, TRANSACTIONS, TRANSACTION_AMOUNT, TRANSACTION_DESCRIPTION,
    TRANSACTION_FROM, TRANSACTION_STATUS, TRANSACTION_TO, TRANSACTION_TYPE,
};
use crate::isolation::IsolationLevel;
use crate::session::TransactionSession;
use crate::storage::{Datum, Guard, RecordId};

pub const TRANSFER_TYPE: &str = "TRANSFER";
pub const COMPLETED_STATUS: &str = "COMPLETED";
pub const NON_NEGATIVE_BALANCE: &str = "PositiveBalanceConstraint";
pub const ACCOUNT_EXISTS: &str = "AccountExistenceConstraint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Completed,
    /// The sender's balance did not cover the amount. Nothing was written.
    InsufficientFunds,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub status: TransferStatus,
    /// Id of the recorded transfer, if it committed.
    pub transaction_id: Option<RecordId>,
    pub from_account_id: u64,
    pub to_account_id: u64,
    pub amount: f64,
    pub from_new_balance: Option<f64>,
    pub to_new_balance: Option<f64>,
    pub description: String,
    pub processed_at: SystemTime,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub error: Option<LabError>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}

/// What a transfer split over separately committed steps leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokenTransferResult {
    pub partially_completed: bool,
    pub from_balance: f64,
    pub to_balance: f64,
    pub from_account_updated: bool,
    pub to_account_updated: bool,
    pub transaction_recorded: bool,
    /// Money debited from the sender that never reached the receiver.
    pub missing_amount: f64,
    pub error_message: String,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    pub violation_occurred: bool,
    pub constraint_name: String,
    pub error_message: Option<String>,
    pub attempted_action: String,
    pub prevented_state: String,
}

/// Money movements between accounts, run atomically or, for demonstration,
/// deliberately not.
#[derive(Clone)]
pub struct TransferService {
    sessions: TransactionSession,
}

impl TransferService {
    pub fn new(sessions: TransactionSession) -> Self {
        Self { sessions }
    }

    /// Moves `amount` from one account to another in a single session: a
    /// guarded debit, a credit and a transfer record. Either all three commit
    /// or none does.
    ///
    /// # Errors
    ///
    /// [`LabError::InvalidInput`] for a non-positive amount or a transfer to
    /// the same account, and fatal collaborator failures. An uncovered amount
    /// comes back as [`TransferStatus::InsufficientFunds`].
    pub fn transfer(
        &self,
        from_account_id: u64,
        to_account_id: u64,
        amount: f64,
        description: &str,
        level: IsolationLevel,
    ) -> Result<TransferResult> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LabError::InvalidInput(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }
        if from_account_id == to_account_id {
            return Err(LabError::InvalidInput(format!(
                "cannot transfer from account {} to itself",
                from_account_id
            )));
        }
        info!(
            "Transferring {:.2} from {} to {}: {}",
            amount, from_account_id, to_account_id, description
        );

        let from = account(from_account_id);
        let to = account(to_account_id);
        let outcome = self.sessions.run(level, |scope| {
            let debited = scope.conditional_update(
                &from,
                BALANCE,
                -amount,
                &Guard::AtLeast(Datum::Decimal(amount)),
            )?;
            if debited == 0 {
                let balance = scope.read(&from, BALANCE)?.as_f64()?;
                return Err(LabError::InsufficientFunds {
                    account: from_account_id,
                    balance,
                    requested: amount,
                });
            }
            scope.conditional_update(&to, BALANCE, amount, &Guard::Always)?;
            let from_balance = scope.read(&from, BALANCE)?.as_f64()?;
            let to_balance = scope.read(&to, BALANCE)?.as_f64()?;
            let id = scope.insert_record(
                TRANSACTIONS,
                fields([
                    (TRANSACTION_FROM, Datum::Int(from_account_id as i64)),
                    (TRANSACTION_TO, Datum::Int(to_account_id as i64)),
                    (TRANSACTION_AMOUNT, Datum::Decimal(amount)),
                    (TRANSACTION_TYPE, Datum::from(TRANSFER_TYPE)),
                    (TRANSACTION_STATUS, Datum::from(COMPLETED_STATUS)),
                    (TRANSACTION_DESCRIPTION, Datum::from(description)),
                ]),
            )?;
            Ok((id, from_balance, to_balance))
        })?;

        let mut result = TransferResult {
            status: TransferStatus::Failed,
            transaction_id: None,
            from_account_id,
            to_account_id,
            amount,
            from_new_balance: None,
            to_new_balance: None,
            description: description.to_string(),
            processed_at: SystemTime::now(),
            error_message: outcome.error_message,
            error: outcome.error,
        };
        match (outcome.value, &result.error) {
            (Some((id, from_balance, to_balance)), _) => {
                result.status = TransferStatus::Completed;
                result.transaction_id = Some(id);
                result.from_new_balance = Some(from_balance);
                result.to_new_balance = Some(to_balance);
            }
            (None, Some(LabError::InsufficientFunds { .. })) => {
                warn!(
                    "Insufficient funds for transfer of {:.2} from {} to {}",
                    amount, from_account_id, to_account_id
                );
                result.status = TransferStatus::InsufficientFunds;
            }
            (None, _) => {}
        }
        Ok(result)
    }

    /// Runs the debit and the credit of a transfer as separately committed
    /// steps and fails in between, leaving the sender debited and the
    /// receiver untouched. This mutates the stored balances.
    pub fn broken_transfer(
        &self,
        from_account_id: u64,
        to_account_id: u64,
        amount: f64,
    ) -> Result<BrokenTransferResult> {
        info!(
            "Demonstrating broken atomicity: {:.2} from {} to {}",
            amount, from_account_id, to_account_id
        );
        let from = account(from_account_id);
        let before_from = self.balance(from_account_id)?;
        let before_to = self.balance(to_account_id)?;

        let mut problems = Vec::new();
        let debit = self.sessions.run(IsolationLevel::ReadCommitted, |scope| {
            scope.write_field(&from, BALANCE, before_from - amount)
        })?;
        let from_account_updated = debit.value == Some(1);
        if !from_account_updated {
            problems.push("Failed to update sender account balance".to_string());
        }

        let failure = LabError::Other("simulated failure between debit and credit".to_string());
        problems.push(format!("Exception occurred during transfer: {}", failure));
        problems.push("Database state is inconsistent".to_string());
        problems.push("Sender account was debited but receiver account was not credited".to_string());
        warn!("Broken transfer left problems: {:?}", problems);

        let from_balance = self.balance(from_account_id)?;
        let to_balance = self.balance(to_account_id)?;
        Ok(BrokenTransferResult {
            partially_completed: from_account_updated,
            from_balance,
            to_balance,
            from_account_updated,
            to_account_updated: false,
            transaction_recorded: false,
            missing_amount: (before_from + before_to) - (from_balance + to_balance),
            error_message: failure.to_string(),
            problems,
        })
    }

    /// Tries to apply `delta` to a balance without committing and reports
    /// whether the non-negative balance rule stopped it.
    pub fn check_consistency(&self, account_id: u64, delta: f64) -> Result<ConsistencyCheck> {
        let key = account(account_id);
        let guard = if delta < 0.0 {
            Guard::AtLeast(Datum::Decimal(-delta))
        } else {
            Guard::Always
        };
        let outcome = self.sessions.run(IsolationLevel::ReadCommitted, |scope| {
            let current = scope.read(&key, BALANCE)?.as_f64()?;
            let applied = scope.conditional_update(&key, BALANCE, delta, &guard)?;
            scope.rollback_only();
            Ok((current, applied))
        })?;

        match (outcome.value, outcome.error) {
            (Some((current, 0)), _) => Ok(ConsistencyCheck {
                violation_occurred: true,
                constraint_name: NON_NEGATIVE_BALANCE.to_string(),
                error_message: Some(format!(
                    "Account balance cannot be negative. Attempted to set: {:.2}",
                    current + delta
                )),
                attempted_action: "Update account balance to negative value".to_string(),
                prevented_state: "Negative account balance".to_string(),
            }),
            (Some((current, _)), _) => Ok(ConsistencyCheck {
                violation_occurred: false,
                constraint_name: NON_NEGATIVE_BALANCE.to_string(),
                error_message: None,
                attempted_action: format!("Update account balance to {:.2}", current + delta),
                prevented_state: "N/A - no violation".to_string(),
            }),
            (None, Some(LabError::NotFound(what))) => Ok(ConsistencyCheck {
                violation_occurred: true,
                constraint_name: ACCOUNT_EXISTS.to_string(),
                error_message: Some(format!("Account not found: {}", what)),
                attempted_action: "Access non-existent account".to_string(),
                prevented_state: "Invalid account access".to_string(),
            }),
            (None, Some(e)) => Err(e),
            (None, None) => Err(LabError::Other("consistency check returned nothing".to_string())),
        }
    }

    /// Latest committed balance of an account.
    pub fn balance(&self, account_id: u64) -> Result<f64> {
        let key = account(account_id);
        let outcome = self.sessions.run(IsolationLevel::ReadCommitted, |scope| {
            scope.read(&key, BALANCE)?.as_f64()
        })?;
        match (outcome.value, outcome.error) {
            (Some(balance), _) => Ok(balance),
            (None, Some(e)) => Err(e),
            (None, None) => Err(LabError::Other("balance read returned nothing".to_string())),
        }
    }
}
