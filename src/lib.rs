pub mod anomaly;
pub mod booking;
pub mod config;
pub mod data_store;
pub mod errors;
pub mod fixtures;
pub mod isolation;
pub mod lab;
pub mod report;
pub mod session;
pub mod simulation;
pub mod storage;
pub mod transfer;

// Re-export key types and structs for easier access
pub use anomaly::{AnomalyDetector, AnomalyKind, AnomalyResult, Snapshot};
pub use booking::{BookingResult, BookingSimulator, BookingStatus};
pub use config::{AnomalyConfig, BookingConfig, LabConfig, ScenarioTiming, SimulationConfig, SyncMode};
pub use data_store::{MemoryStorage, MemoryStorageConfig};
pub use errors::{LabError, Result};
pub use isolation::IsolationLevel;
pub use lab::IsolationLab;
pub use report::{ComparisonRow, IsolationComparison};
pub use session::{
    ActiveSession, CancellationToken, OperationResult, SessionScope, TransactionContext,
    TransactionSession, TransactionStatus,
};
pub use simulation::{LoadSimulator, SimulationSummary};
pub use storage::{Datum, EntityKey, Guard, RecordFilter, Storage};
pub use transfer::{
    BrokenTransferResult, ConsistencyCheck, TransferResult, TransferService, TransferStatus,
};
