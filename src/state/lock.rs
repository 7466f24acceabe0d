//! Per-stack lock records.
//!
//! A lock is a small JSON record stored next to the stack's state. It expires
//! on its own so a crashed apply cannot block a stack forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// How often a running apply renews its lock: a third of the expiry.
pub const LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(100);

/// Information about a stack lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Locked stack.
    pub stack: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock record for `stack` held by `holder`.
    ///
    /// An empty holder is replaced with [`generate_holder_id`].
    #[must_use]
    pub fn new(stack: &str, holder: &str) -> Self {
        let now = Utc::now();
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        Self {
            lock_id: Uuid::new_v4().to_string(),
            stack: stack.to_string(),
            holder,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Pushes the expiry out by another [`LOCK_EXPIRY_SECS`] from now.
    pub fn renew(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("blog", "ci-runner");
        assert_eq!(lock.stack, "blog");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_empty_holder_gets_generated_id() {
        let lock = LockInfo::new("blog", "");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("blog", "me");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_renew_revives_expired_lock() {
        let mut lock = LockInfo::new("blog", "me");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let id = lock.lock_id.clone();

        lock.renew();
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert_eq!(lock.lock_id, id);
    }

    #[test]
    fn test_renew_interval_is_well_inside_expiry() {
        assert!(LOCK_RENEW_INTERVAL.as_secs() * 3 <= LOCK_EXPIRY_SECS.unsigned_abs());
    }

    #[test]
    fn test_holder_ids_are_unique() {
        assert_ne!(generate_holder_id(), generate_holder_id());
    }
}
