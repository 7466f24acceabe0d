// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # stackdiff
//!
//! A declarative infrastructure engine: declare resources, get a validated
//! dependency graph, and converge a stack to it with an ordered change plan.
//!
//! ## Overview
//!
//! stackdiff lets you:
//!
//! - Declare networks, instances, databases and access rules in a stack file
//! - Catch every schema, reference and topology problem before anything runs
//! - See exactly which resources will be created, updated or deleted
//! - Apply plans one operation at a time, resuming after partial failures
//!
//! ## Architecture
//!
//! 1. **Declared graph**: built from `stackdiff.yaml` and validated
//! 2. **Applied state**: the graph last provisioned for the stack
//! 3. **Planner**: diffs the two into an ordered list of operations
//! 4. **Applier**: runs the plan under a per-stack lock and records the result
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing and environment overrides
//! - [`graph`]: Resource declarations, graph building and validation
//! - [`planner`]: Diff computation, change plans and plan execution
//! - [`backend`]: Provisioning backends (HTTP, simulated)
//! - [`state`]: Applied-state storage (local, S3) and locking
//! - [`apply`]: End-to-end apply and destroy
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: blog
//!
//! resources:
//!   - id: net1
//!     kind: NETWORK
//!     properties:
//!       cidr: 10.0.0.0/16
//!   - id: web1
//!     kind: INSTANCE
//!     properties:
//!       network: net1
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod apply;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use apply::{Applier, ApplyReport};
pub use backend::{HttpBackend, ProvisioningBackend, SimulatedBackend};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{StackFile, StackParser};
pub use error::{Result, StackError};
pub use graph::{GraphValidator, ResourceDeclaration, ResourceGraph, ResourceKind};
pub use planner::{ChangePlan, DiffEngine, Operation, OperationType, PlanExecutor, plan};
pub use state::{AppliedState, LocalStateStore, S3StateStore, StateStore};
