//! Stack file types.
//!
//! These structs map one-to-one to `stackdiff.yaml`: a `stack` section with
//! the stack name and where its state and provisioner live, followed by the
//! ordered list of resource declarations.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GraphError};
use crate::graph::{ResourceDeclaration, ResourceGraph, is_valid_id};

/// The root structure of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackFile {
    /// Stack settings.
    pub stack: StackConfig,
    /// Resource declarations, in order.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
}

/// Stack-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Stack name. Keys the applied state and the lock.
    pub name: String,
    /// Applied-state storage.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning backend.
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (uses the AWS default chain if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// State directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provisioning backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: ProvisionerKind,
    /// Base URL of the provider API (http backend only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Provisioning backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    /// Record operations in memory without touching any provider.
    #[default]
    Simulate,
    /// Forward operations to an HTTP provider endpoint.
    Http,
}

/// Default directory for local state.
pub const DEFAULT_STATE_DIR: &str = ".stackdiff";

const fn default_timeout_secs() -> u64 {
    30
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            backend: ProvisionerKind::default(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl StackFile {
    /// Builds the resource graph from the declared resources.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the declarations do not form a valid graph.
    pub fn build_graph(&self) -> Result<ResourceGraph, GraphError> {
        ResourceGraph::build(self.resources.clone())
    }

    /// Turns plain strings into references and CIDR values where the schema
    /// expects them.
    pub fn normalize(&mut self) {
        for decl in &mut self.resources {
            decl.normalize();
        }
    }
}

impl StateConfig {
    /// Directory used by the local backend.
    #[must_use]
    pub fn local_dir(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_STATE_DIR)
    }
}

impl StackConfig {
    /// Checks stack settings that the resource validator does not cover.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError::ValidationError`] naming the first bad field.
    pub fn check(&self) -> Result<(), ConfigError> {
        if !is_valid_id(&self.name) {
            return Err(ConfigError::validation(
                format!(
                    "Stack name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                    self.name
                ),
                "stack.name",
            ));
        }

        if self.state.backend == StateBackend::S3
            && self.state.bucket.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::validation(
                "S3 bucket name is required when using S3 backend",
                "stack.state.bucket",
            ));
        }

        if self.provisioner.backend == ProvisionerKind::Http {
            match self.provisioner.endpoint.as_deref() {
                None | Some("") => {
                    return Err(ConfigError::validation(
                        "Provisioner endpoint is required when using http backend",
                        "stack.provisioner.endpoint",
                    ));
                }
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    return Err(ConfigError::validation(
                        format!("Provisioner endpoint '{url}' must start with http:// or https://"),
                        "stack.provisioner.endpoint",
                    ));
                }
                Some(_) => {}
            }
        }

        if self.provisioner.timeout_secs == 0 {
            return Err(ConfigError::validation(
                "Provisioner timeout must be at least 1 second",
                "stack.provisioner.timeout_secs",
            ));
        }

        Ok(())
    }
}
