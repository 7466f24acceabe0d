//! State store trait definition.
//!
//! Every method is keyed by stack name, so one store can hold many stacks.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::AppliedState;
use crate::error::{Result, StackError, StateError};

/// Trait for applied-state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state of a stack.
    ///
    /// Returns `None` if the stack has never been applied.
    async fn load(&self, stack: &str) -> Result<Option<AppliedState>>;

    /// Replaces the applied state of `state.stack` in a single write.
    ///
    /// `expected_revision` is the revision the caller read (`None` for no
    /// state). If the stored revision differs the write is refused with
    /// [`StateError::ConcurrentModification`].
    async fn save(&self, state: &AppliedState, expected_revision: Option<u64>) -> Result<()>;

    /// Deletes the applied state and lock of a stack.
    async fn delete(&self, stack: &str) -> Result<()>;

    /// Checks if a stack has applied state.
    async fn exists(&self, stack: &str) -> Result<bool>;

    /// Acquires the lock on a stack.
    ///
    /// Fails with [`StateError::LockedByOther`] if an unexpired lock exists.
    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo>;

    /// Extends the expiry of a lock this caller still holds.
    ///
    /// Fails with [`StateError::LockFailed`] if the lock is gone or now has a
    /// different id.
    async fn renew_lock(&self, stack: &str, lock_id: &str) -> Result<LockInfo>;

    /// Releases a lock. Does nothing if the current lock has a different id.
    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()>;

    /// Removes the lock on a stack regardless of who holds it.
    async fn force_unlock(&self, stack: &str) -> Result<()>;

    /// Gets the current lock record, expired or not.
    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>>;

    /// Checks if a stack has an unexpired lock.
    async fn is_locked(&self, stack: &str) -> Result<bool> {
        Ok(self
            .get_lock_info(stack)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, stack: &str) -> Result<Option<AppliedState>> {
        (**self).load(stack).await
    }

    async fn save(&self, state: &AppliedState, expected_revision: Option<u64>) -> Result<()> {
        (**self).save(state, expected_revision).await
    }

    async fn delete(&self, stack: &str) -> Result<()> {
        (**self).delete(stack).await
    }

    async fn exists(&self, stack: &str) -> Result<bool> {
        (**self).exists(stack).await
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(stack, holder).await
    }

    async fn renew_lock(&self, stack: &str, lock_id: &str) -> Result<LockInfo> {
        (**self).renew_lock(stack, lock_id).await
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        (**self).release_lock(stack, lock_id).await
    }

    async fn force_unlock(&self, stack: &str) -> Result<()> {
        (**self).force_unlock(stack).await
    }

    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        (**self).get_lock_info(stack).await
    }

    async fn is_locked(&self, stack: &str) -> Result<bool> {
        (**self).is_locked(stack).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Refuses a save whose expected revision does not match the stored one.
pub(crate) fn check_revision(
    stack: &str,
    expected: Option<u64>,
    stored: Option<&AppliedState>,
) -> Result<()> {
    let found = stored.map(|s| s.revision);
    if found == expected {
        Ok(())
    } else {
        Err(StackError::State(StateError::ConcurrentModification {
            stack: stack.to_string(),
            expected,
            found,
        }))
    }
}

/// Refuses to take a lock that is held and unexpired.
pub(crate) fn check_lock_free(existing: Option<&LockInfo>) -> Result<()> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(StackError::State(StateError::LockedByOther {
            stack: lock.stack.clone(),
            holder: lock.holder.clone(),
            since: lock.acquired_at.to_rfc3339(),
        })),
        _ => Ok(()),
    }
}

/// Returns the stored lock if it still carries `lock_id`.
pub(crate) fn check_lock_held(
    stack: &str,
    lock_id: &str,
    existing: Option<LockInfo>,
) -> Result<LockInfo> {
    match existing {
        Some(lock) if lock.lock_id == lock_id => Ok(lock),
        Some(lock) => Err(StackError::State(StateError::LockFailed {
            message: format!(
                "Lock {lock_id} on stack '{stack}' was replaced by {} (holder: {})",
                lock.lock_id, lock.holder
            ),
        })),
        None => Err(StackError::State(StateError::LockFailed {
            message: format!("Lock {lock_id} on stack '{stack}' no longer exists"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceGraph;

    #[test]
    fn test_check_revision() {
        let state = AppliedState::next("blog", None, ResourceGraph::empty());
        assert!(check_revision("blog", None, None).is_ok());
        assert!(check_revision("blog", Some(1), Some(&state)).is_ok());

        let err = check_revision("blog", None, Some(&state)).unwrap_err();
        assert!(err.is_concurrent_modification());
    }

    #[test]
    fn test_check_lock_free() {
        assert!(check_lock_free(None).is_ok());

        let mut lock = LockInfo::new("blog", "other");
        assert!(check_lock_free(Some(&lock)).is_err());

        lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        assert!(check_lock_free(Some(&lock)).is_ok());
    }

    #[test]
    fn test_check_lock_held() {
        let lock = LockInfo::new("blog", "me");
        let held = check_lock_held("blog", &lock.lock_id, Some(lock.clone())).unwrap();
        assert_eq!(held, lock);

        let other = LockInfo::new("blog", "intruder");
        let err = check_lock_held("blog", &lock.lock_id, Some(other)).unwrap_err();
        assert!(err.to_string().contains("intruder"));

        assert!(matches!(
            check_lock_held("blog", &lock.lock_id, None),
            Err(StackError::State(StateError::LockFailed { .. }))
        ));
    }
}
