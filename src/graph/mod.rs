//! Resource graph module.
//!
//! This module holds the declarative model and the first two pipeline stages:
//! - Typed resource declarations and their per-kind schemas
//! - Building the dependency graph from references
//! - Validating the graph against the schemas
//! - Content hashing for change detection

mod declaration;
mod schema;
mod builder;
mod validator;
mod cidr;
mod hash;

pub use declaration::{Properties, PropertyValue, ResourceDeclaration, ResourceKind};
pub use schema::{KindSchema, PropertySpec, ValueType, DATABASE_SIZES, INSTANCE_SIZES};
pub use builder::{Edge, ResourceGraph};
pub use validator::{GraphValidator, IssueCode, ValidationIssue, is_valid_id};
pub use cidr::{Cidr, CidrError};
pub use hash::GraphHasher;
