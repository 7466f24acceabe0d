//! In-process backend that records operations instead of provisioning.
//!
//! Used for dry runs, local development and tests. Failures can be injected
//! per resource id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::planner::Operation;

use super::ProvisioningBackend;

#[derive(Debug)]
enum Failure {
    Always(BackendError),
    Times(u32, BackendError),
}

#[derive(Debug, Default)]
struct Inner {
    executed: Vec<Operation>,
    failures: HashMap<String, Failure>,
}

/// Backend that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    inner: Mutex<Inner>,
    /// Artificial latency per operation.
    delay: Option<Duration>,
}

impl SimulatedBackend {
    /// Creates a backend that accepts every operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every operation on `id` with `error`.
    #[must_use]
    pub fn fail_on(mut self, id: impl Into<String>, error: BackendError) -> Self {
        self.inner
            .get_mut()
            .failures
            .insert(id.into(), Failure::Always(error));
        self
    }

    /// Fails the first `times` operations on `id` with `error`.
    #[must_use]
    pub fn fail_times(mut self, id: impl Into<String>, times: u32, error: BackendError) -> Self {
        self.inner
            .get_mut()
            .failures
            .insert(id.into(), Failure::Times(times, error));
        self
    }

    /// Sleeps for `delay` before answering each operation.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the operations that succeeded, in order.
    pub async fn executed(&self) -> Vec<Operation> {
        self.inner.lock().await.executed.clone()
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn execute(&self, stack: &str, operation: &Operation) -> Result<(), BackendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        let outcome = match inner.failures.get_mut(&operation.id) {
            Some(Failure::Always(error)) => Err(error.clone()),
            Some(Failure::Times(remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            }
            _ => Ok(()),
        };

        match outcome {
            Ok(()) => {
                info!("[simulate] {stack}: {}", operation.description());
                inner.executed.push(operation.clone());
                Ok(())
            }
            Err(error) => {
                debug!("[simulate] {stack}: {} fails with {error}", operation.label());
                Err(error)
            }
        }
    }

    fn name(&self) -> &'static str {
        "simulate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use crate::planner::OperationType;

    fn create(id: &str) -> Operation {
        Operation {
            operation: OperationType::Create,
            id: id.to_string(),
            kind: ResourceKind::Instance,
            before: None,
            after: Some(crate::graph::Properties::new()),
        }
    }

    #[tokio::test]
    async fn test_records_successful_operations() {
        let backend = SimulatedBackend::new();
        tokio_test::assert_ok!(backend.execute("blog", &create("web1")).await);
        tokio_test::assert_ok!(backend.execute("blog", &create("web2")).await);

        let ids: Vec<String> = backend.executed().await.into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["web1", "web2"]);
        assert_eq!(backend.name(), "simulate");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = SimulatedBackend::new()
            .fail_on("db1", BackendError::provider(400, "bad engine"))
            .fail_times("web1", 1, BackendError::network("reset"));

        assert!(backend.execute("blog", &create("db1")).await.is_err());
        assert!(backend.execute("blog", &create("db1")).await.is_err());

        assert_eq!(
            backend.execute("blog", &create("web1")).await,
            Err(BackendError::network("reset"))
        );
        tokio_test::assert_ok!(backend.execute("blog", &create("web1")).await);

        assert_eq!(backend.executed().await.len(), 1);
    }
}
