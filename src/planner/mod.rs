//! Change planning and execution.
//!
//! This module compares a declared graph with the applied one, turns the
//! difference into an ordered [`ChangePlan`], and runs plans against a
//! provisioning backend.

mod diff;
mod plan;
mod executor;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use plan::{ChangePlan, Operation, OperationType, plan};
pub use executor::{
    CancelHandle, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, ExecutionResult, FailureCause,
    OperationFailure, PlanExecutor,
};
