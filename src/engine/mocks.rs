//! Test doubles for the engine seam.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::BrokerError;
use crate::workspace::{OperationKind, Workspace, WorkspaceId};

use super::runner::{EngineRunner, RunOutcome};

/// Scripted engine runner.
///
/// Runs complete immediately unless `hold()` was used, in which case every
/// run blocks until `release()` — handy for pinning an execution in its
/// non-terminal state while a test probes the mutual-exclusion invariant.
pub struct FakeRunner {
    success: bool,
    diagnostics: Vec<String>,
    outputs: BTreeMap<String, Value>,
    gate: Option<(watch::Sender<bool>, watch::Receiver<bool>)>,
    calls: Mutex<Vec<(WorkspaceId, OperationKind)>>,
}

impl FakeRunner {
    pub fn succeeding() -> Self {
        Self {
            success: true,
            diagnostics: vec!["apply complete".to_string()],
            outputs: BTreeMap::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding_with_outputs(outputs: BTreeMap<String, Value>) -> Self {
        Self {
            outputs,
            ..Self::succeeding()
        }
    }

    pub fn failing(diagnostics: Vec<String>) -> Self {
        Self {
            success: false,
            diagnostics,
            outputs: BTreeMap::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Block every run until `release()` is called.
    pub fn hold(mut self) -> Self {
        self.gate = Some(watch::channel(false));
        self
    }

    pub fn release(&self) {
        if let Some((tx, _)) = &self.gate {
            let _ = tx.send(true);
        }
    }

    /// Every run dispatched through this runner, in order.
    pub fn calls(&self) -> Vec<(WorkspaceId, OperationKind)> {
        self.calls.lock().expect("fake runner poisoned").clone()
    }
}

#[async_trait]
impl EngineRunner for FakeRunner {
    async fn run(
        &self,
        workspace: &Workspace,
        kind: OperationKind,
    ) -> Result<RunOutcome, BrokerError> {
        self.calls
            .lock()
            .expect("fake runner poisoned")
            .push((workspace.id.clone(), kind));

        if let Some((_, rx)) = &self.gate {
            let mut rx = rx.clone();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        Ok(RunOutcome {
            success: self.success,
            diagnostics: self.diagnostics.clone(),
            outputs: if kind == OperationKind::Apply {
                self.outputs.clone()
            } else {
                BTreeMap::new()
            },
        })
    }
}
