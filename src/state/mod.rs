//! State management for applied resources.
//!
//! The persisted snapshot is the engine's only record of what exists. It is
//! written after every successful step, never repaired automatically, and
//! loaded with integrity checks on every run.

mod ledger;
mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use ledger::StateLedger;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
#[cfg(test)]
pub use store::MockStateStore;
pub use store::StateStore;
pub use types::{HistoryEntry, RunOperation, STATE_VERSION, StateRecord, StateSnapshot};
