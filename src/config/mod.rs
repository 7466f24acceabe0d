//! Stack file configuration.
//!
//! This module handles loading `stackdiff.yaml`:
//! - Parsing YAML or JSON stack files into typed settings and declarations
//! - `.env` loading and environment overrides
//! - Discovering the stack file from the working directory upward

mod spec;
mod parser;

pub use spec::{
    DEFAULT_STATE_DIR, ProvisionerConfig, ProvisionerKind, StackConfig, StackFile, StateBackend,
    StateConfig,
};
pub use parser::{
    DEFAULT_STACK_FILES, ENV_PROVISIONER_ENDPOINT, ENV_PROVISIONER_TOKEN, ENV_STACK_NAME,
    ENV_STATE_BUCKET, ENV_STATE_PREFIX, StackParser, find_stack_file,
};
