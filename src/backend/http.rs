//! HTTP provisioning backend.
//!
//! Each operation is sent as `POST {endpoint}/operations` with a JSON body
//! describing the change. The provider answers with a status code only.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::BackendError;
use crate::graph::{Properties, ResourceKind};
use crate::planner::{Operation, OperationType};

use super::ProvisioningBackend;

/// Retry delay used when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP provisioning backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// HTTP client.
    client: Client,
    /// `{endpoint}/operations`.
    operations_url: String,
    /// Bearer token, if the provider needs one.
    token: Option<String>,
}

/// Request body for one operation.
#[derive(Debug, Serialize)]
struct OperationRequest<'a> {
    stack: &'a str,
    operation: OperationType,
    id: &'a str,
    kind: ResourceKind,
    before: Option<&'a Properties>,
    after: Option<&'a Properties>,
}

impl HttpBackend {
    /// Creates a backend for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BackendError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            operations_url: format!("{}/operations", endpoint.trim_end_matches('/')),
            token,
        })
    }

    fn classify(
        status: StatusCode,
        retry_after: Option<u64>,
        body: String,
        operation: &Operation,
    ) -> Result<(), BackendError> {
        if status.is_success() {
            return Ok(());
        }

        match status.as_u16() {
            404 if operation.operation == OperationType::Delete => {
                debug!("Resource {} already gone", operation.id);
                Ok(())
            }
            429 => Err(BackendError::RateLimited {
                retry_after_secs: retry_after
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            }),
            401 | 403 => Err(BackendError::AuthenticationFailed {
                message: if body.is_empty() {
                    format!("Provider refused credentials ({status})")
                } else {
                    body
                },
            }),
            code => Err(BackendError::provider(code, body)),
        }
    }
}

#[async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn execute(&self, stack: &str, operation: &Operation) -> Result<(), BackendError> {
        let request = OperationRequest {
            stack,
            operation: operation.operation,
            id: &operation.id,
            kind: operation.kind,
            before: operation.before.as_ref(),
            after: operation.after.as_ref(),
        };
        trace!("POST {} for {}", self.operations_url, operation.label());

        let mut builder = self
            .client
            .post(&self.operations_url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        Self::classify(status, retry_after, body, operation)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
