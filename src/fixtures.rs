//! Names of the tables and fields the lab works on, and the seed data
//! [`IsolationLab::reset_test_data`](crate::IsolationLab::reset_test_data)
//! restores.

use crate::errors::Result;
use crate::isolation::IsolationLevel;
use crate::session::TransactionSession;
use crate::storage::{Datum, EntityKey, Fields};

pub const ACCOUNTS: &str = "accounts";
pub const BALANCE: &str = "balance";

pub const PRODUCTS: &str = "products";
pub const AVAILABLE_QUANTITY: &str = "available_quantity";
pub const RESERVED_QUANTITY: &str = "reserved_quantity";

pub const ORDERS: &str = "orders";
pub const ORDER_USER_ID: &str = "user_id";
pub const ORDER_TOTAL: &str = "total_amount";
pub const ORDER_STATUS: &str = "status";

pub const TRANSACTIONS: &str = "transactions";
pub const TRANSACTION_FROM: &str = "from_account_id";
pub const TRANSACTION_TO: &str = "to_account_id";
pub const TRANSACTION_AMOUNT: &str = "amount";
pub const TRANSACTION_TYPE: &str = "transaction_type";
pub const TRANSACTION_STATUS: &str = "status";
pub const TRANSACTION_DESCRIPTION: &str = "description";

pub const BOOKINGS: &str = "concurrent_bookings";
pub const BOOKING_USER_ID: &str = "user_id";
pub const BOOKING_PRODUCT_ID: &str = "product_id";
pub const BOOKING_QUANTITY: &str = "quantity";

/// (account id, balance)
pub const SEED_ACCOUNTS: [(u64, f64); 3] = [(1, 1000.0), (2, 2500.0), (3, 500.0)];
/// (product id, available quantity)
pub const SEED_PRODUCTS: [(u64, i64); 3] = [(1, 10), (2, 100), (3, 5)];
/// (user id, total, status)
pub const SEED_ORDERS: [(i64, f64, &str); 4] = [
    (1, 120.0, "PENDING"),
    (2, 75.5, "PENDING"),
    (1, 300.0, "COMPLETED"),
    (3, 42.0, "CANCELLED"),
];

pub fn account(id: u64) -> EntityKey {
    EntityKey::new(ACCOUNTS, id)
}

pub fn product(id: u64) -> EntityKey {
    EntityKey::new(PRODUCTS, id)
}

pub fn fields<const N: usize>(pairs: [(&str, Datum); N]) -> Fields {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

pub fn order_fields(user_id: i64, total: f64, status: &str) -> Fields {
    fields([
        (ORDER_USER_ID, Datum::Int(user_id)),
        (ORDER_TOTAL, Datum::Decimal(total)),
        (ORDER_STATUS, Datum::from(status)),
    ])
}

/// Clears orders, bookings and transfer records and restores seed accounts, products and
/// orders in a single committed session.
pub fn seed(sessions: &TransactionSession) -> Result<()> {
    let outcome = sessions.run(IsolationLevel::ReadCommitted, |scope| {
        scope.truncate(ORDERS)?;
        scope.truncate(BOOKINGS)?;
        scope.truncate(TRANSACTIONS)?;
        for (id, balance) in SEED_ACCOUNTS {
            scope.upsert_entity(&account(id), fields([(BALANCE, Datum::Decimal(balance))]))?;
        }
        for (id, available) in SEED_PRODUCTS {
            scope.upsert_entity(
                &product(id),
                fields([
                    (AVAILABLE_QUANTITY, Datum::Int(available)),
                    (RESERVED_QUANTITY, Datum::Int(0)),
                ]),
            )?;
        }
        for (user_id, total, status) in SEED_ORDERS {
            scope.insert_record(ORDERS, order_fields(user_id, total, status))?;
        }
        Ok(())
    })?;

    match outcome.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
