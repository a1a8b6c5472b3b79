use std::time::{Instant, SystemTime};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::BookingConfig;
use crate::errors::Result;
use crate::fixtures::{
    fields, product, AVAILABLE_QUANTITY, BOOKINGS, BOOKING_PRODUCT_ID, BOOKING_QUANTITY,
    BOOKING_USER_ID, RESERVED_QUANTITY,
};
use crate::isolation::IsolationLevel;
use crate::session::{CancellationToken, SessionScope, TransactionSession};
use crate::storage::{Datum, Guard};

pub const RACE_LOST_NOTE: &str = "Race condition - stock modified by another transaction";
pub const INSUFFICIENT_STOCK_NOTE: &str = "Insufficient stock";
pub const NO_ISSUES_NOTE: &str = "None";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Success,
    /// The pre-read showed less stock than requested. Nothing was written.
    InsufficientStock,
    /// The pre-read showed enough stock but the guarded decrement matched no
    /// row: another session took the units in between.
    RaceLost,
    /// The collaborator failed, the session timed out, or the request was
    /// invalid.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingResult {
    pub status: BookingStatus,
    pub resource_id: u64,
    pub requester_id: u64,
    pub requested_quantity: i64,
    /// Units actually taken, zero unless the booking succeeded.
    pub actual_quantity: i64,
    /// Stock left as computed from this session's own pre-read. Only exact
    /// when the isolation level kept the row from changing underneath.
    pub remaining_stock: Option<i64>,
    pub isolation_level: IsolationLevel,
    /// Wall time spent in `book`. `None` for operations that were cancelled
    /// before they started.
    pub execution_time_ms: Option<f64>,
    pub issue_notes: String,
    pub booked_at: SystemTime,
}

impl BookingResult {
    pub(crate) fn failed(
        resource_id: u64,
        requester_id: u64,
        requested_quantity: i64,
        isolation_level: IsolationLevel,
        issue_notes: String,
    ) -> Self {
        Self {
            status: BookingStatus::Failed,
            resource_id,
            requester_id,
            requested_quantity,
            actual_quantity: 0,
            remaining_stock: None,
            isolation_level,
            execution_time_ms: None,
            issue_notes,
            booked_at: SystemTime::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BookingStatus::Success
    }
}

enum Reservation {
    Booked { remaining: i64 },
    Insufficient { available: i64 },
    RaceLost,
}

/// Books units of a product inside one session.
///
/// Stock is only ever decremented through a guarded update, so concurrent
/// bookings can lose races but never drive the stock negative.
#[derive(Clone)]
pub struct BookingSimulator {
    sessions: TransactionSession,
    config: BookingConfig,
}

impl BookingSimulator {
    pub fn new(sessions: TransactionSession, config: BookingConfig) -> Self {
        let sessions = sessions.with_timeout(config.session_timeout);
        Self { sessions, config }
    }

    /// Returns a simulator whose sessions stop at their next call once `token`
    /// is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            sessions: self.sessions.with_cancellation(token),
            config: self.config.clone(),
        }
    }

    pub fn config(&self) -> &BookingConfig {
        &self.config
    }

    /// Attempts to book `quantity` units of `resource_id` for `requester_id`.
    ///
    /// Never fails: every outcome, including collaborator errors, comes back
    /// as a [`BookingResult`].
    pub fn book(
        &self,
        resource_id: u64,
        requester_id: u64,
        quantity: i64,
        level: IsolationLevel,
    ) -> BookingResult {
        let started = Instant::now();
        let mut result =
            BookingResult::failed(resource_id, requester_id, quantity, level, String::new());

        if quantity <= 0 {
            result.issue_notes = format!("Invalid input: quantity must be positive, got {}", quantity);
            result.execution_time_ms = Some(elapsed_ms(started));
            return result;
        }

        let lock = self.config.lock_rows_on_read && level.locks_rows_on_read();
        let outcome = self.sessions.run(level, |scope| {
            reserve(scope, resource_id, requester_id, quantity, lock)
        });

        match outcome {
            Ok(op) => match op.value {
                Some(Reservation::Booked { remaining }) => {
                    result.status = BookingStatus::Success;
                    result.actual_quantity = quantity;
                    result.remaining_stock = Some(remaining);
                    result.issue_notes = NO_ISSUES_NOTE.to_string();
                }
                Some(Reservation::Insufficient { available }) => {
                    result.status = BookingStatus::InsufficientStock;
                    result.remaining_stock = Some(available);
                    result.issue_notes = INSUFFICIENT_STOCK_NOTE.to_string();
                }
                Some(Reservation::RaceLost) => {
                    result.status = BookingStatus::RaceLost;
                    result.issue_notes = RACE_LOST_NOTE.to_string();
                }
                None => {
                    result.issue_notes = op.error_message.unwrap_or_default();
                }
            },
            Err(e) => {
                warn!("Booking for requester {} could not start: {}", requester_id, e);
                result.issue_notes = e.to_string();
            }
        }

        result.execution_time_ms = Some(elapsed_ms(started));
        debug!(
            "Booking requester={} product={} qty={} at {}: {:?} ({})",
            requester_id, resource_id, quantity, level, result.status, result.issue_notes
        );
        result
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn reserve(
    scope: &mut SessionScope<'_>,
    resource_id: u64,
    requester_id: u64,
    quantity: i64,
    lock: bool,
) -> Result<Reservation> {
    let item = product(resource_id);
    let available = if lock {
        scope.read_for_update(&item, AVAILABLE_QUANTITY)?
    } else {
        scope.read(&item, AVAILABLE_QUANTITY)?
    }
    .as_i64()?;

    if available < quantity {
        return Ok(Reservation::Insufficient { available });
    }

    let updated = scope.conditional_update(
        &item,
        AVAILABLE_QUANTITY,
        -quantity,
        &Guard::AtLeast(Datum::Int(quantity)),
    )?;
    if updated == 0 {
        return Ok(Reservation::RaceLost);
    }

    scope.conditional_update(&item, RESERVED_QUANTITY, quantity, &Guard::Always)?;
    scope.insert_record(
        BOOKINGS,
        fields([
            (BOOKING_USER_ID, Datum::Int(requester_id as i64)),
            (BOOKING_PRODUCT_ID, Datum::Int(resource_id as i64)),
            (BOOKING_QUANTITY, Datum::Int(quantity)),
        ]),
    )?;

    Ok(Reservation::Booked {
        remaining: available - quantity,
    })
}
