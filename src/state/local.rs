//! Local file-based state storage backend.
//!
//! Each stack gets `<dir>/<stack>.state.json` and `<dir>/<stack>.lock`. State
//! is written to a temporary file and renamed into place; lock files are
//! created exclusively so two processes cannot both take a free lock.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::{StateStore, check_lock_free, check_lock_held, check_revision};
use super::types::{AppliedState, STATE_VERSION};

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding state and lock files.
    base_dir: PathBuf,
    /// Serializes read-check-write in `save` within this process.
    save_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a store rooted at `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            save_guard: Mutex::new(()),
        }
    }

    /// Path of a stack's state file.
    #[must_use]
    pub fn state_path(&self, stack: &str) -> PathBuf {
        self.base_dir.join(format!("{stack}.state.json"))
    }

    /// Path of a stack's lock file.
    #[must_use]
    pub fn lock_path(&self, stack: &str) -> PathBuf {
        self.base_dir.join(format!("{stack}.lock"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackError::State(StateError::storage(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self, stack: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(stack);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(&lock_info.stack))
            .await;

        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StackError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(true)
    }

    /// Overwrites the lock file through a rename so readers never see a
    /// partial record.
    async fn replace_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let path = self.lock_path(&lock_info.stack);
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let temp_path = path.with_extension("lock.tmp");
        fs::write(&temp_path, content).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to replace lock file: {e}"),
            })
        })
    }

    async fn delete_lock_file(&self, stack: &str) -> Result<()> {
        let path = self.lock_path(stack);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }

    async fn write_state(&self, state: &AppliedState) -> Result<()> {
        let path = self.state_path(&state.stack);
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StackError::State(StateError::storage(format!(
                "Failed to create temp state file: {e}"
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackError::State(StateError::storage(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::storage(format!("Failed to sync state file: {e}")))
        })?;

        fs::rename(&temp_path, &path).await.map_err(|e| {
            StackError::State(StateError::storage(format!(
                "Failed to rename state file: {e}"
            )))
        })?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, stack: &str) -> Result<Option<AppliedState>> {
        let path = self.state_path(stack);
        if !path.exists() {
            debug!("State file does not exist: {}", path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", path.display());

        let content = fs::read_to_string(&path).await.map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: AppliedState = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(StackError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &AppliedState, expected_revision: Option<u64>) -> Result<()> {
        let _guard = self.save_guard.lock().await;
        self.ensure_dir().await?;

        let stored = self.load(&state.stack).await?;
        check_revision(&state.stack, expected_revision, stored.as_ref())?;

        info!(
            "Saving state revision {} to: {}",
            state.revision,
            self.state_path(&state.stack).display()
        );
        self.write_state(state).await?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self, stack: &str) -> Result<()> {
        let path = self.state_path(stack);
        if path.exists() {
            info!("Deleting state file: {}", path.display());
            fs::remove_file(&path).await.map_err(|e| {
                StackError::State(StateError::storage(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file(stack).await
    }

    async fn exists(&self, stack: &str) -> Result<bool> {
        Ok(self.state_path(stack).exists())
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        let lock_info = LockInfo::new(stack, holder);

        if !self.create_lock_file(&lock_info).await? {
            let existing = self.read_lock_file(stack).await?;
            check_lock_free(existing.as_ref())?;

            warn!("Expired lock found on stack '{stack}', taking over");
            self.delete_lock_file(stack).await?;
            if !self.create_lock_file(&lock_info).await? {
                return Err(StackError::State(StateError::LockFailed {
                    message: format!("Another process took the lock on stack '{stack}'"),
                }));
            }
        }

        info!(
            "Acquired lock on stack '{stack}': {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, stack: &str, lock_id: &str) -> Result<LockInfo> {
        let existing = self.read_lock_file(stack).await?;
        let mut lock = check_lock_held(stack, lock_id, existing)?;
        lock.renew();
        self.replace_lock_file(&lock).await?;

        debug!("Renewed lock on stack '{stack}' until {}", lock.expires_at);
        Ok(lock)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file(stack).await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file(stack).await?;
                info!("Released lock on stack '{stack}': {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self, stack: &str) -> Result<()> {
        warn!("Force-removing lock on stack '{stack}'");
        self.delete_lock_file(stack).await
    }

    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        self.read_lock_file(stack).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
