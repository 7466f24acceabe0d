//! Stack file loading.
//!
//! Stack files are YAML or JSON (chosen by extension, YAML otherwise). After
//! parsing, resource properties are normalized against the kind schemas and
//! environment overrides are applied on top of the file.

use crate::error::{ConfigError, Result, StackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackFile;

/// Overrides `stack.name`.
pub const ENV_STACK_NAME: &str = "STACKDIFF_STACK_NAME";
/// Overrides `stack.state.bucket`.
pub const ENV_STATE_BUCKET: &str = "STACKDIFF_STATE_BUCKET";
/// Overrides `stack.state.prefix`.
pub const ENV_STATE_PREFIX: &str = "STACKDIFF_STATE_PREFIX";
/// Overrides `stack.provisioner.endpoint`.
pub const ENV_PROVISIONER_ENDPOINT: &str = "STACKDIFF_PROVISIONER_ENDPOINT";
/// Bearer token for the http provisioner.
pub const ENV_PROVISIONER_TOKEN: &str = "STACKDIFF_PROVISIONER_TOKEN";

/// Stack file names searched for, in order.
pub const DEFAULT_STACK_FILES: &[&str] = &["stackdiff.yaml", "stackdiff.yml", "stackdiff.json"];

/// Loader for stack files.
#[derive(Debug, Default)]
pub struct StackParser {
    /// Directory searched for `.env`.
    base_path: Option<PathBuf>,
}

impl StackParser {
    /// Creates a new stack parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads and normalizes a stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackFile> {
        let path = path.as_ref();
        info!("Loading stack file from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a stack file from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackFile> {
        debug!("Parsing YAML stack file");

        let file: StackFile = serde_yaml::from_str(content).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        Ok(Self::finish(file))
    }

    /// Parses a stack file from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<StackFile> {
        debug!("Parsing JSON stack file");

        let file: StackFile = serde_json::from_str(content).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("JSON parse error at line {}: {e}", e.line()),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        Ok(Self::finish(file))
    }

    fn finish(mut file: StackFile) -> StackFile {
        file.normalize();
        debug!(
            "Parsed stack '{}' with {} resource(s)",
            file.stack.name,
            file.resources.len()
        );
        file
    }

    /// Loads a stack file and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackFile> {
        let mut file = self.load_file(path)?;
        Self::apply_overrides(&mut file, |key| std::env::var(key).ok());
        Ok(file)
    }

    /// Applies overrides looked up through `lookup`.
    pub fn apply_overrides(file: &mut StackFile, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup(ENV_STACK_NAME) {
            debug!("Overriding stack.name from environment");
            file.stack.name = name;
        }

        if let Some(bucket) = lookup(ENV_STATE_BUCKET) {
            debug!("Overriding stack.state.bucket from environment");
            file.stack.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup(ENV_STATE_PREFIX) {
            debug!("Overriding stack.state.prefix from environment");
            file.stack.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = lookup(ENV_PROVISIONER_ENDPOINT) {
            debug!("Overriding stack.provisioner.endpoint from environment");
            file.stack.provisioner.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the http provisioner token from the environment, if set.
    #[must_use]
    pub fn provisioner_token() -> Option<String> {
        std::env::var(ENV_PROVISIONER_TOKEN)
            .ok()
            .filter(|token| !token.is_empty())
    }
}

/// Finds the stack file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_stack_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_STACK_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found stack file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_STACK_FILES[0]),
    }))
}
