//! In-memory state store for tests.
//!
//! Mirrors the SQLite store's semantics, including the conditional-insert
//! invariant and terminal-row immutability. Restart recovery is simulated by
//! sharing one `MemoryStore` across "processes" (independent dispatcher and
//! monitor instances).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{StateStore, StoreError};
use crate::workspace::{BindingRecord, Execution, InstanceRecord, Workspace, WorkspaceId};

#[derive(Default)]
struct Inner {
    workspaces: HashMap<WorkspaceId, Workspace>,
    // Ordered per workspace; the last entry is the most recent dispatch.
    executions: HashMap<WorkspaceId, Vec<Execution>>,
    instances: HashMap<String, InstanceRecord>,
    bindings: HashMap<(String, String), BindingRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All executions ever dispatched for a workspace, oldest first.
    pub fn execution_history(&self, workspace_id: &WorkspaceId) -> Vec<Execution> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .executions
            .get(workspace_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .workspaces
            .insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn load_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.workspaces.get(id).cloned())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let history = inner
            .executions
            .entry(execution.workspace_id.clone())
            .or_default();
        if history.iter().any(|e| !e.state.is_terminal()) {
            return Err(StoreError::ExecutionInFlight {
                workspace_id: execution.workspace_id.to_string(),
            });
        }
        history.push(execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let history = inner
            .executions
            .entry(execution.workspace_id.clone())
            .or_default();
        match history
            .iter_mut()
            .find(|e| e.id == execution.id && !e.state.is_terminal())
        {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(StoreError::ExecutionNotLive {
                execution_id: execution.id.clone(),
            }),
        }
    }

    async fn load_execution(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<Execution>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .executions
            .get(workspace_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .instances
            .insert(record.instance_guid.clone(), record.clone());
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_guid: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.instances.get(instance_guid).cloned())
    }

    async fn save_binding(&self, record: &BindingRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.bindings.insert(
            (record.instance_guid.clone(), record.binding_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn load_binding(
        &self,
        instance_guid: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .bindings
            .get(&(instance_guid.to_string(), binding_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::OperationKind;

    #[tokio::test]
    async fn conditional_insert_matches_sqlite_semantics() {
        let store = MemoryStore::new();
        let workspace_id = WorkspaceId::for_instance("i1");

        let first = Execution::pending(workspace_id.clone(), OperationKind::Apply);
        store.create_execution(&first).await.unwrap();

        let second = Execution::pending(workspace_id.clone(), OperationKind::Apply);
        assert!(matches!(
            store.create_execution(&second).await,
            Err(StoreError::ExecutionInFlight { .. })
        ));

        let mut first = first;
        first.mark_succeeded(vec![], Default::default());
        store.update_execution(&first).await.unwrap();
        store.create_execution(&second).await.unwrap();

        assert_eq!(store.execution_history(&workspace_id).len(), 2);
    }

    #[tokio::test]
    async fn terminal_rows_cannot_be_rewritten() {
        let store = MemoryStore::new();
        let mut execution =
            Execution::pending(WorkspaceId::for_instance("i1"), OperationKind::Destroy);
        store.create_execution(&execution).await.unwrap();

        execution.mark_failed(vec!["boom".to_string()]);
        store.update_execution(&execution).await.unwrap();

        execution.mark_succeeded(vec![], Default::default());
        assert!(matches!(
            store.update_execution(&execution).await,
            Err(StoreError::ExecutionNotLive { .. })
        ));
    }
}
