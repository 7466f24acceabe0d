//! Applied-state storage.
//!
//! This module records the last applied graph of every stack, with revision
//! numbers for optimistic concurrency and per-stack locks with expiry.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub(crate) use store::check_lock_held;
pub use local::LocalStateStore;
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEW_INTERVAL, LockInfo, generate_holder_id};
pub use types::{AppliedState, ApplyHistoryEntry, ApplyOperation, MAX_HISTORY, STATE_VERSION};
