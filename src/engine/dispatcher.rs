//! Operation dispatch.
//!
//! Dispatch turns a rendered workspace plus an operation kind into a running
//! execution. Preconditions are enforced here: the workspace must already be
//! rendered, and the store's conditional insert guarantees at most one
//! non-terminal execution per workspace. The run itself happens on a spawned
//! task that writes its terminal state back to the store, so the dispatching
//! request's lifetime does not bound the run.

use std::sync::Arc;

use tracing::{error, info};

use crate::correlation::CorrelationId;
use crate::error::BrokerError;
use crate::store::{StateStore, StoreError};
use crate::workspace::{Execution, OperationKind, WorkspaceId};

use super::runner::EngineRunner;

/// Handle for monitoring a dispatched execution.
///
/// Carries only durable identifiers, so a handle can be reconstructed after
/// a process restart with `reattach` and waited on as if it were the
/// original.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub workspace_id: WorkspaceId,
    pub execution_id: String,
}

impl ExecutionHandle {
    /// Re-attach to whatever execution is current for a workspace.
    pub fn reattach(workspace_id: WorkspaceId) -> Self {
        ExecutionHandle {
            workspace_id,
            execution_id: String::new(),
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    runner: Arc<dyn EngineRunner>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn StateStore>, runner: Arc<dyn EngineRunner>) -> Self {
        Self { store, runner }
    }

    /// Start an engine run against an already-rendered workspace.
    ///
    /// Fails with `Dispatch` when no workspace exists for the id and with
    /// `ConcurrentOperation` when another execution is still in flight.
    /// Neither failure creates an execution record the caller must clean up.
    pub async fn dispatch(
        &self,
        workspace_id: &WorkspaceId,
        kind: OperationKind,
        correlation_id: &CorrelationId,
    ) -> Result<ExecutionHandle, BrokerError> {
        let workspace = self
            .store
            .load_workspace(workspace_id)
            .await?
            .ok_or_else(|| BrokerError::Dispatch {
                workspace_id: workspace_id.to_string(),
                reason: "no workspace rendered for this id".to_string(),
            })?;

        let execution = Execution::pending(workspace_id.clone(), kind);
        match self.store.create_execution(&execution).await {
            Ok(()) => {}
            Err(StoreError::ExecutionInFlight { workspace_id }) => {
                return Err(BrokerError::ConcurrentOperation { workspace_id });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            workspace.id = %workspace_id,
            execution.id = %execution.id,
            operation = %kind,
            correlation.id = %correlation_id,
            "Execution dispatched"
        );

        let handle = ExecutionHandle {
            workspace_id: workspace_id.clone(),
            execution_id: execution.id.clone(),
        };

        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let correlation_id = correlation_id.clone();
        tokio::spawn(async move {
            let mut execution = execution;
            execution.mark_running();
            if let Err(e) = store.update_execution(&execution).await {
                error!(
                    execution.id = %execution.id,
                    correlation.id = %correlation_id,
                    error = %e,
                    "Failed to mark execution running"
                );
                return;
            }

            let outcome = runner.run(&workspace, kind).await;
            match outcome {
                Ok(outcome) if outcome.success => {
                    execution.mark_succeeded(outcome.diagnostics, outcome.outputs);
                }
                Ok(outcome) => {
                    execution.mark_failed(outcome.diagnostics);
                }
                Err(e) => {
                    execution.mark_failed(vec![format!("engine invocation failed: {e}")]);
                }
            }

            if let Err(e) = store.update_execution(&execution).await {
                error!(
                    execution.id = %execution.id,
                    correlation.id = %correlation_id,
                    error = %e,
                    "Failed to persist terminal execution state"
                );
                return;
            }

            info!(
                workspace.id = %execution.workspace_id,
                execution.id = %execution.id,
                state = %execution.state,
                correlation.id = %correlation_id,
                "Execution reached terminal state"
            );
        });

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mocks::FakeRunner;
    use crate::store::MemoryStore;
    use crate::template::{TemplateDefinition, TemplateStore};
    use crate::vars::VarContext;
    use crate::workspace::{ExecutionState, OperationType};
    use std::time::Duration;

    async fn render_workspace(store: Arc<MemoryStore>, workspace_id: &WorkspaceId) {
        let templates = TemplateStore::new(store);
        let definition = TemplateDefinition {
            name: "provision-settings".to_string(),
            body: "resource \"sql_db\" \"main\" {}".to_string(),
            required: vec![],
        };
        templates
            .update_workspace_hcl(workspace_id, &definition, &VarContext::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatch_without_workspace_creates_no_execution() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeRunner::succeeding());
        let dispatcher = Dispatcher::new(store.clone(), runner);
        let workspace_id = WorkspaceId::for_instance("never-rendered");
        let correlation_id = CorrelationId::derive("never-rendered", "", OperationType::Deprovision);

        let err = dispatcher
            .dispatch(&workspace_id, OperationKind::Destroy, &correlation_id)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Dispatch { .. }));
        assert!(store.load_execution(&workspace_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_dispatches_serialize_per_workspace() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeRunner::succeeding().hold());
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), runner.clone()));
        let workspace_id = WorkspaceId::for_instance("i1");
        render_workspace(store.clone(), &workspace_id).await;
        let correlation_id = CorrelationId::derive("i1", "", OperationType::Provision);

        let attempts = (0..4).map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            let workspace_id = workspace_id.clone();
            let correlation_id = correlation_id.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&workspace_id, OperationKind::Apply, &correlation_id)
                    .await
            })
        });

        let results = futures::future::join_all(attempts).await;
        let (ok, busy): (Vec<_>, Vec<_>) = results
            .into_iter()
            .map(|joined| joined.unwrap())
            .partition(|r| r.is_ok());

        assert_eq!(ok.len(), 1, "exactly one dispatch must win");
        assert!(busy
            .iter()
            .all(|r| matches!(r, Err(BrokerError::ConcurrentOperation { .. }))));

        runner.release();
    }

    #[tokio::test]
    async fn run_outcome_is_persisted_as_terminal_state() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeRunner::failing(vec!["quota exceeded".to_string()]));
        let dispatcher = Dispatcher::new(store.clone(), runner);
        let workspace_id = WorkspaceId::for_instance("i1");
        render_workspace(store.clone(), &workspace_id).await;
        let correlation_id = CorrelationId::derive("i1", "", OperationType::Provision);

        dispatcher
            .dispatch(&workspace_id, OperationKind::Apply, &correlation_id)
            .await
            .unwrap();

        // The run task completes asynchronously.
        let mut state = ExecutionState::Pending;
        for _ in 0..50 {
            if let Some(execution) = store.load_execution(&workspace_id).await.unwrap() {
                state = execution.state;
                if state.is_terminal() {
                    assert_eq!(state, ExecutionState::Failed);
                    assert_eq!(execution.diagnostics, vec!["quota exceeded".to_string()]);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never reached a terminal state (last: {state:?})");
    }
}
