//! Execution monitoring.
//!
//! `wait` polls the durable store until the execution for a workspace
//! reaches a terminal state. Because it reads persisted state rather than an
//! in-memory join handle, a waiter can re-attach after a process restart (or
//! a local timeout) and observe the same terminal outcome the original
//! caller would have. Timing out or cancelling the wait never touches the
//! underlying run; only the run's own completion sets the terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::BrokerError;
use crate::store::StateStore;
use crate::workspace::{Execution, ExecutionState};

use super::dispatcher::ExecutionHandle;

/// Caller-held side of a cancellation pair.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal observed by `wait`, distinct from the timeout bound.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires, for callers without a cancellation source.
    pub fn noop() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancelToken { rx }
    }

    async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without firing; never cancel.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

pub struct Monitor {
    store: Arc<dyn StateStore>,
    poll_interval: Duration,
}

impl Monitor {
    pub fn new(store: Arc<dyn StateStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Suspend until the handle's execution is terminal, the timeout
    /// elapses, or the token fires.
    ///
    /// Succeeded runs return the execution with its captured outputs. Failed
    /// runs return `ProvisioningFailure` carrying the diagnostic log; the
    /// workspace is left in place for inspection. `WaitTimeout` and
    /// `Cancelled` abort only the local wait — a later `wait` on the same
    /// handle observes the eventual terminal state.
    pub async fn wait(
        &self,
        handle: &ExecutionHandle,
        timeout: Duration,
        mut cancel: CancelToken,
    ) -> Result<Execution, BrokerError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(execution) = self.store.load_execution(&handle.workspace_id).await? {
                if execution.state.is_terminal() {
                    debug!(
                        workspace.id = %handle.workspace_id,
                        execution.id = %execution.id,
                        state = %execution.state,
                        "Wait observed terminal state"
                    );
                    return match execution.state {
                        ExecutionState::Succeeded => Ok(execution),
                        ExecutionState::Failed => Err(BrokerError::ProvisioningFailure {
                            workspace_id: handle.workspace_id.to_string(),
                            diagnostics: execution.diagnostics,
                        }),
                        _ => unreachable!("terminal check guarantees terminal state"),
                    };
                }
            }

            tokio::select! {
                _ = &mut deadline => {
                    return Err(BrokerError::WaitTimeout {
                        workspace_id: handle.workspace_id.to_string(),
                        waited: timeout,
                    });
                }
                _ = cancel.cancelled() => {
                    return Err(BrokerError::Cancelled {
                        workspace_id: handle.workspace_id.to_string(),
                    });
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
