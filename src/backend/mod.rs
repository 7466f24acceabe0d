//! Provisioning backends.
//!
//! A backend performs one planned operation against the real provider. The
//! engine never looks inside a backend; it only sees success or a
//! [`BackendError`].

mod http;
mod simulated;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::planner::Operation;

pub use http::HttpBackend;
pub use simulated::SimulatedBackend;

/// Trait for provisioning backends.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Performs one operation for `stack`.
    ///
    /// Must not retry internally; the executor owns retries.
    async fn execute(&self, stack: &str, operation: &Operation) -> Result<(), BackendError>;

    /// Gets the backend name.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl ProvisioningBackend for Box<dyn ProvisioningBackend> {
    async fn execute(&self, stack: &str, operation: &Operation) -> Result<(), BackendError> {
        (**self).execute(stack, operation).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
