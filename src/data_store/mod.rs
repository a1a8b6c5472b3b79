/// In-memory collaborator that provides isolation effects for tests and demos.
pub mod memory;
/// Per-session write buffers.
pub mod txn_buffer;
/// Committed field history.
pub mod versioned_value;

pub use memory::{MemoryStorage, MemoryStorageConfig};
