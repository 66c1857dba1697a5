//! Core workspace and execution types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::vars::VarContext;

/// Deterministic identifier for a workspace, derived from the instance GUID
/// and (for binding-scoped operations) the binding ID. The same pair always
/// yields the same id, which is what makes re-dispatch idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Instance-scoped id, used for provision and deprovision.
    pub fn for_instance(instance_guid: &str) -> Self {
        Self::derive(instance_guid, "")
    }

    /// Binding-scoped id, used for bind and unbind.
    pub fn for_binding(instance_guid: &str, binding_id: &str) -> Self {
        Self::derive(instance_guid, binding_id)
    }

    pub fn derive(instance_guid: &str, binding_id: &str) -> Self {
        WorkspaceId(format!("tf:{}:{}", instance_guid, binding_id))
    }

    /// Rehydrate an id previously persisted via `as_str`.
    pub(crate) fn from_raw(raw: String) -> Self {
        WorkspaceId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form, used to name the working directory a run
    /// executes in.
    pub fn dir_name(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marketplace-level operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Provision,
    Deprovision,
    Bind,
    Unbind,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Provision => "provision",
            OperationType::Deprovision => "deprovision",
            OperationType::Bind => "bind",
            OperationType::Unbind => "unbind",
        }
    }

    /// The engine-level operation this maps to.
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationType::Provision | OperationType::Bind => OperationKind::Apply,
            OperationType::Deprovision | OperationType::Unbind => OperationKind::Destroy,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two operations the external provisioning engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Converge declared resources into existence.
    Apply,
    /// Tear down previously created resources.
    Destroy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Apply => "apply",
            OperationKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered, addressable unit of declarative configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub template_name: String,
    pub rendered_config: String,
    pub variables: VarContext,
    pub updated_at: DateTime<Utc>,
}

/// Progress of one engine run against a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Succeeded | ExecutionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionState::Pending),
            "running" => Some(ExecutionState::Running),
            "succeeded" => Some(ExecutionState::Succeeded),
            "failed" => Some(ExecutionState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of the external engine, durable across process restarts.
///
/// Created `Pending` at dispatch, moves to `Running` when the external
/// process starts, and ends in exactly one of `Succeeded` or `Failed`.
/// Terminal rows are never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub operation: OperationKind,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Ordered engine log lines captured from the run.
    pub diagnostics: Vec<String>,
    /// Structured outputs reported by a succeeded apply.
    pub outputs: BTreeMap<String, Value>,
}

impl Execution {
    pub fn pending(workspace_id: WorkspaceId, operation: OperationKind) -> Self {
        Execution {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            operation,
            state: ExecutionState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            diagnostics: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.state = ExecutionState::Running;
    }

    pub fn mark_succeeded(&mut self, diagnostics: Vec<String>, outputs: BTreeMap<String, Value>) {
        self.state = ExecutionState::Succeeded;
        self.finished_at = Some(Utc::now());
        self.diagnostics = diagnostics;
        self.outputs = outputs;
    }

    pub fn mark_failed(&mut self, diagnostics: Vec<String>) {
        self.state = ExecutionState::Failed;
        self.finished_at = Some(Utc::now());
        self.diagnostics = diagnostics;
    }
}

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Provisioning,
    Provisioned,
    Deprovisioning,
    Deprovisioned,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Provisioned => "provisioned",
            InstanceState::Deprovisioning => "deprovisioning",
            InstanceState::Deprovisioned => "deprovisioned",
        }
    }
}

/// Lifecycle state of a binding, orthogonal to its instance's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingState {
    Binding,
    Bound,
    Unbinding,
    Unbound,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Binding => "binding",
            BindingState::Bound => "bound",
            BindingState::Unbinding => "unbinding",
            BindingState::Unbound => "unbound",
        }
    }
}

/// Durable record of a service instance: lifecycle state plus the outputs
/// captured from its last successful apply, which later binds consume as
/// variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_guid: String,
    pub state: InstanceState,
    pub outputs: BTreeMap<String, Value>,
    pub last_failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of a binding and the credentials its apply produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub instance_guid: String,
    pub binding_id: String,
    pub state: BindingState,
    pub credentials: BTreeMap<String, Value>,
    pub last_failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_is_stable_per_pair() {
        assert_eq!(
            WorkspaceId::for_binding("i1", "b1"),
            WorkspaceId::derive("i1", "b1")
        );
        assert_eq!(WorkspaceId::for_instance("i1").as_str(), "tf:i1:");
        assert_eq!(WorkspaceId::for_binding("i1", "b1").as_str(), "tf:i1:b1");
        assert_ne!(
            WorkspaceId::for_instance("i1"),
            WorkspaceId::for_binding("i1", "b1")
        );
    }

    #[test]
    fn dir_name_is_filesystem_safe() {
        let id = WorkspaceId::for_binding("i1", "b1");
        assert_eq!(id.dir_name(), "tf_i1_b1");
        assert!(!id.dir_name().contains(':'));
    }

    #[test]
    fn operation_type_maps_to_engine_kind() {
        assert_eq!(OperationType::Provision.kind(), OperationKind::Apply);
        assert_eq!(OperationType::Bind.kind(), OperationKind::Apply);
        assert_eq!(OperationType::Deprovision.kind(), OperationKind::Destroy);
        assert_eq!(OperationType::Unbind.kind(), OperationKind::Destroy);
    }

    #[test]
    fn execution_lifecycle_transitions() {
        let mut execution =
            Execution::pending(WorkspaceId::for_instance("i1"), OperationKind::Apply);
        assert_eq!(execution.state, ExecutionState::Pending);
        assert!(!execution.state.is_terminal());

        execution.mark_running();
        assert!(!execution.state.is_terminal());

        execution.mark_succeeded(vec!["done".to_string()], BTreeMap::new());
        assert!(execution.state.is_terminal());
        assert!(execution.finished_at.is_some());
    }

    #[test]
    fn execution_state_round_trips_as_str() {
        for state in [
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::Succeeded,
            ExecutionState::Failed,
        ] {
            assert_eq!(ExecutionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ExecutionState::parse("bogus"), None);
    }
}
