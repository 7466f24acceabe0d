//! Applying declared graphs to a stack.
//!
//! The [`Applier`] runs the full cycle: lock the stack, load the applied
//! state, plan, execute, record what completed, unlock. The lock is renewed
//! for as long as the run lasts.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::ProvisioningBackend;
use crate::error::{ApplyError, GraphError, Result, StackError, StateError};
use crate::graph::{GraphHasher, GraphValidator, ResourceGraph};
use crate::planner::{
    CancelHandle, ChangePlan, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, ExecutionResult,
    Operation, OperationType, PlanExecutor,
};
use crate::state::{
    AppliedState, ApplyHistoryEntry, ApplyOperation, LOCK_RENEW_INTERVAL, StateStore,
    check_lock_held, generate_holder_id,
};

/// Drives plans for stacks held in one state store.
pub struct Applier<'a, S: StateStore + ?Sized, B: ProvisioningBackend + ?Sized> {
    /// Applied-state storage.
    store: &'a S,
    /// Provisioning backend.
    backend: &'a B,
    /// Validator run before every apply.
    validator: GraphValidator,
    /// Lock holder name.
    holder: String,
    /// Attempts per operation.
    max_attempts: u32,
    /// Base retry delay.
    retry_delay: Duration,
    /// Cancellation signal.
    cancel: Option<CancelHandle>,
    /// How often the lock is renewed during a run.
    lock_renew_interval: Duration,
}

/// Outcome of an apply or destroy run.
#[derive(Debug)]
pub struct ApplyReport {
    /// The plan that was executed.
    pub plan: ChangePlan,
    /// What the executor did.
    pub execution: ExecutionResult,
    /// Revision of the applied state after the run, if any state exists.
    pub revision: Option<u64>,
}

impl<'a, S: StateStore + ?Sized, B: ProvisioningBackend + ?Sized> Applier<'a, S, B> {
    /// Creates a new applier.
    #[must_use]
    pub fn new(store: &'a S, backend: &'a B) -> Self {
        Self {
            store,
            backend,
            validator: GraphValidator::new(),
            holder: generate_holder_id(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel: None,
            lock_renew_interval: LOCK_RENEW_INTERVAL,
        }
    }

    /// Uses `validator` instead of the default one.
    #[must_use]
    pub fn with_validator(mut self, validator: GraphValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the lock holder name.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets the number of attempts per operation.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
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

    /// Sets how often the stack lock is renewed while a run is in progress.
    #[must_use]
    pub const fn with_lock_renew_interval(mut self, interval: Duration) -> Self {
        self.lock_renew_interval = interval;
        self
    }

    /// Computes the plan for `current` without locking or executing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or the change cannot be
    /// planned.
    pub async fn preview(&self, stack: &str, current: &ResourceGraph) -> Result<ChangePlan> {
        let previous = self.store.load(stack).await?;
        Ok(ChangePlan::compute(stack, current, previous.as_ref())?)
    }

    /// Converges `stack` to `current`.
    ///
    /// A failed operation does not make this return an error: the report
    /// carries it, and the operations that completed are recorded. Use
    /// [`ApplyReport::into_result`] to turn a partial run into an error.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, the stack is locked, the state
    /// cannot be read or written, or the change cannot be planned.
    pub async fn apply(&self, stack: &str, current: &ResourceGraph) -> Result<ApplyReport> {
        self.validator.validate_strict(current)?;
        self.run(stack, current, ApplyOperation::Apply, None).await
    }

    /// Converges `stack` to `current`, but only if the plan computed under
    /// the lock is the one in `approved`.
    ///
    /// # Errors
    ///
    /// Same as [`Applier::apply`], plus
    /// [`StateError::ConcurrentModification`] if the applied state moved since
    /// `approved` was computed and [`ApplyError::PlanMismatch`] if `approved`
    /// targets another graph.
    pub async fn apply_approved(
        &self,
        stack: &str,
        current: &ResourceGraph,
        approved: &ChangePlan,
    ) -> Result<ApplyReport> {
        self.validator.validate_strict(current)?;
        self.run(stack, current, ApplyOperation::Apply, Some(approved))
            .await
    }

    /// Deletes every resource of `stack`.
    ///
    /// # Errors
    ///
    /// Same as [`Applier::apply`].
    pub async fn destroy(&self, stack: &str) -> Result<ApplyReport> {
        self.run(stack, &ResourceGraph::empty(), ApplyOperation::Destroy, None)
            .await
    }

    /// Deletes every resource of `stack` if the state still matches the
    /// approved destroy plan.
    ///
    /// # Errors
    ///
    /// Same as [`Applier::apply_approved`].
    pub async fn destroy_approved(
        &self,
        stack: &str,
        approved: &ChangePlan,
    ) -> Result<ApplyReport> {
        self.run(
            stack,
            &ResourceGraph::empty(),
            ApplyOperation::Destroy,
            Some(approved),
        )
        .await
    }

    async fn run(
        &self,
        stack: &str,
        current: &ResourceGraph,
        kind: ApplyOperation,
        approved: Option<&ChangePlan>,
    ) -> Result<ApplyReport> {
        let lock = self.store.acquire_lock(stack, &self.holder).await?;
        debug!("Holding lock {} on stack '{stack}'", lock.lock_id);

        let outcome = tokio::select! {
            outcome = self.run_locked(stack, current, kind, approved, &lock.lock_id) => outcome,
            never = self.keep_lock(stack, &lock.lock_id) => match never {},
        };

        match self.store.release_lock(stack, &lock.lock_id).await {
            Ok(()) => outcome,
            Err(e) if outcome.is_ok() => Err(e),
            Err(e) => {
                warn!("Failed to release lock on stack '{stack}': {e}");
                outcome
            }
        }
    }

    /// Renews the lock until dropped. A failed renewal is only logged: the
    /// check before saving refuses to record state under a lost lock.
    async fn keep_lock(&self, stack: &str, lock_id: &str) -> Infallible {
        loop {
            tokio::time::sleep(self.lock_renew_interval).await;
            match self.store.renew_lock(stack, lock_id).await {
                Ok(lock) => debug!("Lock on stack '{stack}' renewed until {}", lock.expires_at),
                Err(e) => warn!("Failed to renew lock on stack '{stack}': {e}"),
            }
        }
    }

    async fn run_locked(
        &self,
        stack: &str,
        current: &ResourceGraph,
        kind: ApplyOperation,
        approved: Option<&ChangePlan>,
        lock_id: &str,
    ) -> Result<ApplyReport> {
        let previous = self.store.load(stack).await?;
        let plan = ChangePlan::compute(stack, current, previous.as_ref())?;
        let base_revision = previous.as_ref().map(|s| s.revision);

        if let Some(approved) = approved {
            check_approved(approved, &plan)?;
        }

        if plan.is_empty() {
            info!("Stack '{stack}' is up to date");
            return Ok(ApplyReport {
                plan,
                execution: ExecutionResult {
                    completed: Vec::new(),
                    failure: None,
                    not_attempted: Vec::new(),
                },
                revision: base_revision,
            });
        }

        let mut executor = PlanExecutor::new(self.backend)
            .with_max_attempts(self.max_attempts)
            .with_retry_delay(self.retry_delay);
        if let Some(cancel) = &self.cancel {
            executor = executor.with_cancel(cancel.clone());
        }
        let execution = executor.execute(&plan).await;

        if execution.completed.is_empty() {
            warn!("No operation completed, state of stack '{stack}' left unchanged");
            return Ok(ApplyReport {
                plan,
                execution,
                revision: base_revision,
            });
        }

        let resources = record_completed(
            current,
            previous.as_ref().map(|s| &s.resources),
            &execution.completed,
        )?;
        let mut state = AppliedState::next(stack, previous.as_ref(), resources);
        let entry = ApplyHistoryEntry::new(
            kind,
            &state,
            execution.completed_labels(),
            execution.error().map(|e| e.to_string()),
        );
        state.add_history(entry);

        let held = self.store.get_lock_info(stack).await?;
        check_lock_held(stack, lock_id, held).inspect_err(|_| {
            warn!(
                "Lost the lock on stack '{stack}', not recording: {}",
                execution.completed_labels().join(", ")
            );
        })?;
        self.store.save(&state, plan.base_revision).await?;
        info!(
            "Recorded revision {} of stack '{stack}' ({} resource(s))",
            state.revision,
            state.resources.len()
        );

        Ok(ApplyReport {
            plan,
            execution,
            revision: Some(state.revision),
        })
    }
}

/// Refuses to run a plan other than the one that was approved.
fn check_approved(approved: &ChangePlan, planned: &ChangePlan) -> Result<()> {
    if approved.base_revision != planned.base_revision {
        return Err(StackError::State(StateError::ConcurrentModification {
            stack: planned.stack.clone(),
            expected: approved.base_revision,
            found: planned.base_revision,
        }));
    }
    if approved.graph_hash != planned.graph_hash {
        return Err(StackError::Apply(ApplyError::PlanMismatch {
            approved: GraphHasher::short_hash(&approved.graph_hash).to_string(),
            declared: GraphHasher::short_hash(&planned.graph_hash).to_string(),
        }));
    }
    Ok(())
}

/// Builds the graph that results from applying `completed` to `previous`.
///
/// Created and updated resources take their declared form, resources whose
/// operation did not run keep their applied form, and completed deletes drop
/// out. On full success the result equals `current`.
///
/// # Errors
///
/// Returns a [`GraphError`] if the mixed graph is not consistent.
pub fn record_completed(
    current: &ResourceGraph,
    previous: Option<&ResourceGraph>,
    completed: &[Operation],
) -> std::result::Result<ResourceGraph, GraphError> {
    let done: HashMap<&str, OperationType> = completed
        .iter()
        .map(|op| (op.id.as_str(), op.operation))
        .collect();

    let mut declarations = Vec::with_capacity(current.len());
    for decl in current.declarations() {
        match done.get(decl.id.as_str()) {
            Some(OperationType::Create | OperationType::Update) => {
                declarations.push(decl.clone());
            }
            _ => {
                if let Some(old) = previous.and_then(|p| p.get(&decl.id)) {
                    declarations.push(old.clone());
                }
            }
        }
    }

    if let Some(previous) = previous {
        declarations.extend(
            previous
                .declarations()
                .iter()
                .filter(|old| {
                    !current.contains(&old.id)
                        && done.get(old.id.as_str()) != Some(&OperationType::Delete)
                })
                .cloned(),
        );
    }

    ResourceGraph::build(declarations)
}

impl ApplyReport {
    /// Returns true if every planned operation completed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.execution.is_success()
    }

    /// Turns a partial run into an error.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Apply`] if an operation failed or the run was
    /// cancelled.
    pub fn into_result(self) -> Result<Self> {
        match self.execution.error() {
            Some(e) => Err(StackError::Apply(e)),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::error::BackendError;
    use crate::graph::{ResourceDeclaration, ResourceKind};
    use crate::state::{LocalStateStore, LockInfo};
    use tempfile::TempDir;

    fn blog(with_rule: bool) -> ResourceGraph {
        let mut decls = vec![
            ResourceDeclaration::new("net1", ResourceKind::Network).cidr("cidr", "10.0.0.0/16"),
            ResourceDeclaration::new("web1", ResourceKind::Instance).reference("network", "net1"),
            ResourceDeclaration::new("db1", ResourceKind::Database).reference("network", "net1"),
        ];
        if with_rule {
            decls.push(
                ResourceDeclaration::new("rule1", ResourceKind::AccessRule)
                    .reference("source", "web1")
                    .reference("target", "db1")
                    .integer("port", 3306),
            );
        }
        ResourceGraph::build(decls).unwrap()
    }

    fn setup() -> (TempDir, LocalStateStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_apply_then_reapply_is_noop() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);

        let first = applier.apply("blog", &blog(true)).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.plan.len(), 4);
        assert_eq!(first.revision, Some(1));

        let second = applier.apply("blog", &blog(true)).await.unwrap();
        assert!(second.plan.is_empty());
        assert_eq!(second.revision, Some(1));
        assert_eq!(backend.executed().await.len(), 4);

        let state = store.load("blog").await.unwrap().unwrap();
        assert_eq!(state.resources, blog(true));
        assert_eq!(state.history.len(), 1);
        assert!(!store.is_locked("blog").await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_apply_records_completed_operations() {
        let (_dir, store) = setup();
        let backend =
            SimulatedBackend::new().fail_on("db1", BackendError::provider(400, "bad engine"));
        let applier = Applier::new(&store, &backend);

        let report = applier.apply("blog", &blog(true)).await.unwrap();
        assert!(!report.is_success());

        let state = store.load("blog").await.unwrap().unwrap();
        let ids: Vec<&str> = state.resources.declarations().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["net1", "web1"]);
        let last = state.last_run().unwrap();
        assert!(!last.success);
        assert_eq!(last.resources, vec!["CREATE net1", "CREATE web1"]);

        assert!(matches!(
            report.into_result(),
            Err(StackError::Apply(ApplyError::OperationFailed { index: 2, .. }))
        ));

        // Resuming only runs what is left.
        let healthy = SimulatedBackend::new();
        let resumed = Applier::new(&store, &healthy).apply("blog", &blog(true)).await.unwrap();
        let labels: Vec<String> = resumed.plan.operations.iter().map(Operation::label).collect();
        assert_eq!(labels, vec!["CREATE db1", "CREATE rule1"]);
        assert_eq!(resumed.revision, Some(2));
    }

    #[tokio::test]
    async fn test_failure_on_first_operation_writes_nothing() {
        let (_dir, store) = setup();
        let backend =
            SimulatedBackend::new().fail_on("net1", BackendError::provider(400, "overlap"));

        let report = Applier::new(&store, &backend).apply("blog", &blog(true)).await.unwrap();
        assert_eq!(report.revision, None);
        assert!(!store.exists("blog").await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_stack_is_refused() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        store.acquire_lock("blog", "someone-else").await.unwrap();

        let err = Applier::new(&store, &backend)
            .apply("blog", &blog(true))
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::State(StateError::LockedByOther { .. })));
        assert!(backend.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_graph_is_refused_before_locking() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let bad =
            ResourceGraph::build(vec![ResourceDeclaration::new("net1", ResourceKind::Network)])
                .unwrap();

        let err = Applier::new(&store, &backend).apply("blog", &bad).await.unwrap_err();
        assert!(matches!(err, StackError::Graph(GraphError::ValidationFailed { .. })));
        assert!(!store.is_locked("blog").await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything_in_reverse_order() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);
        applier.apply("blog", &blog(true)).await.unwrap();

        let report = applier.destroy("blog").await.unwrap();
        let labels: Vec<String> = report.plan.operations.iter().map(Operation::label).collect();
        assert_eq!(
            labels,
            vec!["DELETE rule1", "DELETE db1", "DELETE web1", "DELETE net1"]
        );

        let state = store.load("blog").await.unwrap().unwrap();
        assert!(state.resources.is_empty());
        assert_eq!(state.revision, 2);
        assert_eq!(state.last_run().unwrap().operation, ApplyOperation::Destroy);
    }

    #[tokio::test]
    async fn test_preview_does_not_lock_or_execute() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);
        applier.apply("blog", &blog(true)).await.unwrap();

        let plan = applier.preview("blog", &blog(false)).await.unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].label(), "DELETE rule1");
        assert_eq!(plan.base_revision, Some(1));
        assert_eq!(backend.executed().await.len(), 4);
    }

    /// Rewrites the stored lock as if its expiry had passed.
    fn expire_lock(store: &LocalStateStore, stack: &str) {
        let path = store.lock_path(stack);
        let mut lock: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(&path, serde_json::to_string(&lock).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_lock_is_renewed_during_long_run() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new().with_delay(Duration::from_millis(150));
        let applier =
            Applier::new(&store, &backend).with_lock_renew_interval(Duration::from_millis(20));

        let second_writer = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            expire_lock(&store, "blog");
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.acquire_lock("blog", "second-writer").await
        };

        let desired = blog(true);
        let (report, second) = tokio::join!(applier.apply("blog", &desired), second_writer);
        assert!(report.unwrap().is_success());
        assert!(matches!(
            second,
            Err(StackError::State(StateError::LockedByOther { .. }))
        ));

        let state = store.load("blog").await.unwrap().unwrap();
        assert_eq!(state.resources, blog(true));
        assert!(!store.is_locked("blog").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_that_lost_its_lock_records_nothing() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new().with_delay(Duration::from_millis(100));
        let applier = Applier::new(&store, &backend);

        let takeover = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            store.force_unlock("blog").await.unwrap();
            store.acquire_lock("blog", "second-writer").await.unwrap()
        };

        let desired = blog(true);
        let (result, taken) = tokio::join!(applier.apply("blog", &desired), takeover);
        assert!(matches!(
            result,
            Err(StackError::State(StateError::LockFailed { .. }))
        ));
        assert_eq!(backend.executed().await.len(), 4);
        assert!(!store.exists("blog").await.unwrap());

        let holder = store.get_lock_info("blog").await.unwrap().unwrap();
        assert_eq!(holder.lock_id, taken.lock_id);
    }

    #[tokio::test]
    async fn test_approved_plan_runs_when_nothing_moved() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);

        let approved = applier.preview("blog", &blog(true)).await.unwrap();
        let report = applier.apply_approved("blog", &blog(true), &approved).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.plan.operations, approved.operations);
    }

    #[tokio::test]
    async fn test_approved_plan_is_refused_after_state_moved() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);

        let approved = applier.preview("blog", &blog(false)).await.unwrap();
        assert_eq!(approved.base_revision, None);

        // Another apply lands between approval and execution.
        applier.apply("blog", &blog(true)).await.unwrap();
        let executed = backend.executed().await.len();

        let err = applier
            .apply_approved("blog", &blog(false), &approved)
            .await
            .unwrap_err();
        assert!(err.is_concurrent_modification());
        assert_eq!(backend.executed().await.len(), executed);
        assert_eq!(store.load("blog").await.unwrap().unwrap().revision, 1);
        assert!(!store.is_locked("blog").await.unwrap());
    }

    #[tokio::test]
    async fn test_approved_plan_for_other_graph_is_refused() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);

        let approved = applier.preview("blog", &blog(true)).await.unwrap();
        let err = applier
            .apply_approved("blog", &blog(false), &approved)
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Apply(ApplyError::PlanMismatch { .. })));
        assert!(backend.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_approved_destroy_is_refused_after_state_moved() {
        let (_dir, store) = setup();
        let backend = SimulatedBackend::new();
        let applier = Applier::new(&store, &backend);
        applier.apply("blog", &blog(false)).await.unwrap();

        let approved = applier.preview("blog", &ResourceGraph::empty()).await.unwrap();
        applier.apply("blog", &blog(true)).await.unwrap();

        let err = applier.destroy_approved("blog", &approved).await.unwrap_err();
        assert!(err.is_concurrent_modification());
        assert_eq!(store.load("blog").await.unwrap().unwrap().resources, blog(true));
    }

    #[test]
    fn test_record_completed_keeps_unfinished_resources() {
        let previous = blog(true);
        let current = ResourceGraph::build(
            previous
                .declarations()
                .iter()
                .filter(|d| d.id != "rule1")
                .cloned()
                .map(|d| if d.id == "web1" { d.text("size", "t2.large") } else { d })
                .collect(),
        )
        .unwrap();

        // Nothing ran: the applied graph is unchanged.
        let unchanged = record_completed(&current, Some(&previous), &[]).unwrap();
        assert_eq!(unchanged, previous);

        // The update ran but the delete did not.
        let ops = crate::planner::plan(&current, Some(&previous)).unwrap();
        let partial = record_completed(&current, Some(&previous), &ops[..1]).unwrap();
        let size = partial.get("web1").unwrap().property("size").unwrap();
        assert_eq!(size.as_text(), Some("t2.large"));
        assert!(partial.contains("rule1"));

        let full = record_completed(&current, Some(&previous), &ops).unwrap();
        assert_eq!(full, current);
    }
}
