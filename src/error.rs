use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the orchestration engine.
///
/// The facade decides retry eligibility per variant: `Dispatch` and
/// `WaitTimeout` are transient, `ConcurrentOperation` means wait-and-retry,
/// `TemplateRender` and `ProvisioningFailure` need operator attention.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("template render failed for workspace {workspace_id}: {source}")]
    TemplateRender {
        workspace_id: String,
        #[source]
        source: tera::Error,
    },

    #[error("workspace {workspace_id} is missing required variables: {missing:?}")]
    MissingVariables {
        workspace_id: String,
        missing: Vec<String>,
    },

    #[error("dispatch failed for workspace {workspace_id}: {reason}")]
    Dispatch { workspace_id: String, reason: String },

    #[error("an operation is already in flight for workspace {workspace_id}")]
    ConcurrentOperation { workspace_id: String },

    #[error("provisioning run failed for workspace {workspace_id}")]
    ProvisioningFailure {
        workspace_id: String,
        diagnostics: Vec<String>,
    },

    #[error("timed out after {waited:?} waiting on workspace {workspace_id}")]
    WaitTimeout {
        workspace_id: String,
        waited: Duration,
    },

    #[error("wait cancelled for workspace {workspace_id}")]
    Cancelled { workspace_id: String },

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Diagnostics from a failed run, if this error carries them.
    pub fn diagnostics(&self) -> Option<&[String]> {
        match self {
            BrokerError::ProvisioningFailure { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// Whether the caller may retry the operation after a backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::Dispatch { .. }
                | BrokerError::WaitTimeout { .. }
                | BrokerError::ConcurrentOperation { .. }
        )
    }
}
