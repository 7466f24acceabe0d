//! Plan executor for applying change plans.
//!
//! Operations run strictly in plan order. Retryable backend errors are retried
//! on the same operation; the first hard failure stops the run. Nothing that
//! already completed is unwound.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::ProvisioningBackend;
use crate::error::{ApplyError, BackendError};

use super::plan::{ChangePlan, Operation};

/// Default number of attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Executor for change plans.
#[derive(Debug)]
pub struct PlanExecutor<'a, B: ProvisioningBackend + ?Sized> {
    /// Backend performing the operations.
    backend: &'a B,
    /// Attempts per operation, at least 1.
    max_attempts: u32,
    /// Base delay; attempt `n` waits `n * retry_delay`.
    retry_delay: Duration,
    /// Cancellation signal.
    cancel: Option<CancelHandle>,
}

/// Cooperative cancellation signal shared between an executor and its caller.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

/// Why an operation did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The backend refused the operation or retries ran out.
    Backend(BackendError),
    /// The run was cancelled before or during the operation.
    Cancelled,
}

/// The operation that stopped a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Position in the plan.
    pub index: usize,
    /// The operation.
    pub operation: Operation,
    /// Attempts made (0 if cancelled before starting).
    pub attempts: u32,
    /// What went wrong.
    pub cause: FailureCause,
}

/// Result of executing a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Operations that completed, in plan order.
    pub completed: Vec<Operation>,
    /// The operation that stopped the run, if any.
    pub failure: Option<OperationFailure>,
    /// Operations after the failed one that never ran.
    pub not_attempted: Vec<Operation>,
}

impl CancelHandle {
    /// Creates a handle that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so this only returns once cancelled.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, B: ProvisioningBackend + ?Sized> PlanExecutor<'a, B> {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(backend: &'a B) -> Self {
        Self {
            backend,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel: None,
        }
    }

    /// Sets the number of attempts per operation (minimum 1).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Attaches a cancellation handle.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Executes a change plan.
    ///
    /// Never fails as a whole; the outcome of every operation is in the
    /// returned [`ExecutionResult`].
    pub async fn execute(&self, plan: &ChangePlan) -> ExecutionResult {
        info!(
            "Executing plan for stack '{}' with {} operation(s) via {}",
            plan.stack,
            plan.len(),
            self.backend.name()
        );

        let mut completed = Vec::with_capacity(plan.len());

        for (index, operation) in plan.operations.iter().enumerate() {
            let outcome = if self.is_cancelled() {
                Err((0, FailureCause::Cancelled))
            } else {
                self.run_operation(&plan.stack, operation).await
            };

            match outcome {
                Ok(()) => completed.push(operation.clone()),
                Err((attempts, cause)) => {
                    match &cause {
                        FailureCause::Cancelled => {
                            warn!("Cancelled at operation {}: {}", index + 1, operation.label());
                        }
                        FailureCause::Backend(e) => {
                            error!("Operation {} ({}) failed: {e}", index + 1, operation.label());
                        }
                    }
                    return ExecutionResult {
                        completed,
                        failure: Some(OperationFailure {
                            index,
                            operation: operation.clone(),
                            attempts,
                            cause,
                        }),
                        not_attempted: plan.operations[index + 1..].to_vec(),
                    };
                }
            }
        }

        info!("Plan for stack '{}' applied", plan.stack);
        ExecutionResult {
            completed,
            failure: None,
            not_attempted: Vec::new(),
        }
    }

    /// Runs one operation with retries. On failure returns the attempts made.
    async fn run_operation(
        &self,
        stack: &str,
        operation: &Operation,
    ) -> Result<(), (u32, FailureCause)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("{} (attempt {attempt}/{})", operation.label(), self.max_attempts);

            let result = tokio::select! {
                biased;
                () = self.wait_cancelled() => return Err((attempt, FailureCause::Cancelled)),
                result = self.backend.execute(stack, operation) => result,
            };

            match result {
                Ok(()) => {
                    info!("{} done", operation.label());
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = e
                        .retry_delay_secs()
                        .map_or(self.retry_delay * attempt, Duration::from_secs);
                    warn!(
                        "{} failed ({e}), retrying in {}ms",
                        operation.label(),
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        () = self.wait_cancelled() => return Err((attempt, FailureCause::Cancelled)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err((attempt, FailureCause::Backend(e))),
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled)
    }

    async fn wait_cancelled(&self) {
        match &self.cancel {
            Some(cancel) => cancel.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

impl ExecutionResult {
    /// Returns true if every operation completed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Labels of the completed operations, e.g. `CREATE net1`.
    #[must_use]
    pub fn completed_labels(&self) -> Vec<String> {
        self.completed.iter().map(Operation::label).collect()
    }

    /// Converts a failed run into an [`ApplyError`].
    #[must_use]
    pub fn error(&self) -> Option<ApplyError> {
        let failure = self.failure.as_ref()?;
        let completed = self.completed_labels();
        Some(match &failure.cause {
            FailureCause::Backend(source) => ApplyError::OperationFailed {
                index: failure.index,
                operation: failure.operation.label(),
                completed,
                source: source.clone(),
            },
            FailureCause::Cancelled => ApplyError::Cancelled {
                index: failure.index,
                completed,
            },
        })
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} operation(s) completed", self.completed.len())?;
        if let Some(failure) = &self.failure {
            write!(
                f,
                ", {} stopped after {} attempt(s), {} not attempted",
                failure.operation.label(),
                failure.attempts,
                self.not_attempted.len()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::graph::{ResourceDeclaration, ResourceGraph, ResourceKind};
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        Backend {}

        #[async_trait]
        impl ProvisioningBackend for Backend {
            async fn execute(&self, stack: &str, operation: &Operation) -> Result<(), BackendError>;
            fn name(&self) -> &'static str;
        }
    }

    fn blog_plan() -> ChangePlan {
        let graph = ResourceGraph::build(vec![
            ResourceDeclaration::new("net1", ResourceKind::Network).cidr("cidr", "10.0.0.0/16"),
            ResourceDeclaration::new("web1", ResourceKind::Instance).reference("network", "net1"),
            ResourceDeclaration::new("db1", ResourceKind::Database).reference("network", "net1"),
            ResourceDeclaration::new("rule1", ResourceKind::AccessRule)
                .reference("source", "web1")
                .reference("target", "db1")
                .integer("port", 3306),
        ])
        .unwrap();
        ChangePlan::compute("blog", &graph, None).unwrap()
    }

    fn ids(ops: &[Operation]) -> Vec<&str> {
        ops.iter().map(|op| op.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_executes_in_plan_order() {
        let backend = SimulatedBackend::new();
        let result = PlanExecutor::new(&backend).execute(&blog_plan()).await;

        assert!(result.is_success());
        assert_eq!(ids(&result.completed), vec!["net1", "web1", "db1", "rule1"]);
        assert_eq!(ids(&backend.executed().await), vec!["net1", "web1", "db1", "rule1"]);
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn test_stops_at_first_hard_failure() {
        let backend = SimulatedBackend::new().fail_on("db1", BackendError::provider(400, "bad"));
        let result = PlanExecutor::new(&backend).execute(&blog_plan()).await;

        assert_eq!(ids(&result.completed), vec!["net1", "web1"]);
        assert_eq!(ids(&result.not_attempted), vec!["rule1"]);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.index, 2);
        assert_eq!(failure.attempts, 1);

        let Some(ApplyError::OperationFailed { operation, completed, .. }) = result.error() else {
            unreachable!("expected an operation failure");
        };
        assert_eq!(operation, "CREATE db1");
        assert_eq!(completed, vec!["CREATE net1", "CREATE web1"]);
    }

    #[tokio::test]
    async fn test_retries_retryable_errors() {
        let backend = SimulatedBackend::new().fail_times("web1", 2, BackendError::network("reset"));
        let result = PlanExecutor::new(&backend)
            .with_retry_delay(Duration::from_millis(1))
            .execute(&blog_plan())
            .await;

        assert!(result.is_success());
        assert_eq!(result.completed.len(), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut backend = MockBackend::new();
        backend.expect_name().return_const("mock");
        backend
            .expect_execute()
            .times(2)
            .returning(|_, _| Err(BackendError::provider(503, "unavailable")));

        let result = PlanExecutor::new(&backend)
            .with_max_attempts(2)
            .with_retry_delay(Duration::from_millis(1))
            .execute(&blog_plan())
            .await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.index, 0);
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.cause, FailureCause::Backend(BackendError::provider(503, "unavailable")));
        assert_eq!(result.not_attempted.len(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let mut backend = MockBackend::new();
        backend.expect_name().return_const("mock");
        backend
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(BackendError::AuthenticationFailed {
                message: String::from("expired token"),
            }));

        let result = PlanExecutor::new(&backend).execute(&blog_plan()).await;
        assert_eq!(result.failure.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let backend = SimulatedBackend::new();
        let cancel = CancelHandle::new();
        cancel.cancel();

        let result = PlanExecutor::new(&backend)
            .with_cancel(cancel)
            .execute(&blog_plan())
            .await;

        assert!(result.completed.is_empty());
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.cause, FailureCause::Cancelled);
        assert_eq!(failure.attempts, 0);
        assert!(matches!(result.error(), Some(ApplyError::Cancelled { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight_operation() {
        let backend = SimulatedBackend::new().with_delay(Duration::from_secs(30));
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();

        let executor = PlanExecutor::new(&backend).with_cancel(cancel);
        let plan = blog_plan();
        let (result, ()) = tokio::join!(executor.execute(&plan), async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert!(result.completed.is_empty());
        assert_eq!(result.failure.unwrap().cause, FailureCause::Cancelled);
        assert!(backend.executed().await.is_empty());
    }
}
