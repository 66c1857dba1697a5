//! Durable state store.
//!
//! The store is the single source of truth for the one-in-flight-execution
//! invariant: `create_execution` is an atomic conditional insert, so two
//! concurrent dispatches against the same workspace cannot both observe
//! "nothing in flight" and both proceed. Never guarded by an in-process
//! lock; the broker must tolerate multi-process deployment.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::workspace::{BindingRecord, Execution, InstanceRecord, Workspace, WorkspaceId};

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("a non-terminal execution already exists for workspace {workspace_id}")]
    ExecutionInFlight { workspace_id: String },

    #[error("no live execution {execution_id} to update (terminal rows are immutable)")]
    ExecutionNotLive { execution_id: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence operations the orchestration engine needs.
///
/// Executions, workspaces, and instance/binding records all survive process
/// restarts; a waiter started in a different process observes the same
/// terminal state the dispatching process would have.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a rendered workspace, overwriting any prior rendering for the
    /// same id.
    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), StoreError>;

    async fn load_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError>;

    /// Create an execution record only if no non-terminal execution exists
    /// for its workspace. Returns `ExecutionInFlight` otherwise.
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Update a pending or running execution. Terminal rows are immutable;
    /// updating one returns `ExecutionNotLive`.
    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Load the most recent execution for a workspace, if any.
    async fn load_execution(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<Execution>, StoreError>;

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), StoreError>;

    async fn load_instance(&self, instance_guid: &str)
        -> Result<Option<InstanceRecord>, StoreError>;

    async fn save_binding(&self, record: &BindingRecord) -> Result<(), StoreError>;

    async fn load_binding(
        &self,
        instance_guid: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>, StoreError>;
}
