//! Operation correlation.
//!
//! Every dispatched operation carries a stable identifier derived from the
//! instance GUID, binding ID, and operation type. The same request replayed
//! after a crash derives the same id, so log lines from both attempts
//! correlate. Purely observational; nothing here affects control flow.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workspace::{OperationType, WorkspaceId};

/// Stable identifier tying together all log entries for one logical
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn derive(instance_guid: &str, binding_id: &str, operation: OperationType) -> Self {
        CorrelationId(format!(
            "{}:{}:{}",
            operation.as_str(),
            instance_guid,
            binding_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Span covering one facade operation end-to-end.
pub fn operation_span(
    operation: OperationType,
    correlation_id: &CorrelationId,
    workspace_id: &WorkspaceId,
) -> tracing::Span {
    tracing::info_span!(
        "workspace_operation",
        operation = operation.as_str(),
        correlation.id = %correlation_id,
        workspace.id = %workspace_id,
        otel.kind = "internal"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let a = CorrelationId::derive("i1", "b1", OperationType::Bind);
        let b = CorrelationId::derive("i1", "b1", OperationType::Bind);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "bind:i1:b1");
    }

    #[test]
    fn distinct_operations_get_distinct_ids() {
        let bind = CorrelationId::derive("i1", "b1", OperationType::Bind);
        let unbind = CorrelationId::derive("i1", "b1", OperationType::Unbind);
        assert_ne!(bind, unbind);
    }
}
