//! External provisioning engine invocation.
//!
//! `TerraformRunner` materializes a workspace's rendered configuration into
//! a per-workspace directory and shells out to the engine binary. Each run
//! is `init` followed by `apply` or `destroy`; apply runs additionally read
//! back structured outputs. Engine log lines are captured in order as the
//! execution's diagnostics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::BrokerError;
use crate::workspace::{OperationKind, Workspace};

/// Result of one engine run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub success: bool,
    /// Ordered log lines from the run.
    pub diagnostics: Vec<String>,
    /// Structured outputs, populated on a succeeded apply.
    pub outputs: BTreeMap<String, Value>,
}

/// Interface to the external provisioning engine.
///
/// `run` drives one operation to completion and reports the outcome; it is
/// called from the dispatcher's spawned task, never directly by the facade.
#[async_trait]
pub trait EngineRunner: Send + Sync {
    async fn run(&self, workspace: &Workspace, kind: OperationKind)
        -> Result<RunOutcome, BrokerError>;
}

/// Runs the Terraform CLI against rendered workspaces.
pub struct TerraformRunner {
    binary: PathBuf,
    work_root: PathBuf,
}

impl TerraformRunner {
    /// Resolve the engine binary and working root from configuration.
    /// A missing binary is a dispatch-time failure, not a panic.
    pub fn discover(config: &EngineConfig) -> Result<Self, BrokerError> {
        let binary = which::which(&config.binary).map_err(|e| BrokerError::Dispatch {
            workspace_id: String::new(),
            reason: format!("engine binary {:?} not found: {}", config.binary, e),
        })?;

        Ok(Self {
            binary,
            work_root: PathBuf::from(&config.work_dir),
        })
    }

    pub fn with_paths(binary: PathBuf, work_root: PathBuf) -> Self {
        Self { binary, work_root }
    }

    async fn prepare_dir(&self, workspace: &Workspace) -> Result<PathBuf, BrokerError> {
        let dir = self.work_root.join(workspace.id.dir_name());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| dispatch_error(workspace, format!("creating workspace dir: {e}")))?;
        tokio::fs::write(dir.join("main.tf"), &workspace.rendered_config)
            .await
            .map_err(|e| dispatch_error(workspace, format!("writing workspace config: {e}")))?;
        Ok(dir)
    }

    async fn engine_command(
        &self,
        dir: &Path,
        args: &[&str],
        workspace: &Workspace,
    ) -> Result<Output, BrokerError> {
        debug!(workspace.id = %workspace.id, args = ?args, "Invoking provisioning engine");
        Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| dispatch_error(workspace, format!("spawning engine: {e}")))
    }

    /// Read structured outputs after a successful apply.
    async fn read_outputs(
        &self,
        dir: &Path,
        workspace: &Workspace,
    ) -> Result<BTreeMap<String, Value>, BrokerError> {
        let output = self
            .engine_command(dir, &["output", "-no-color", "-json"], workspace)
            .await?;
        if !output.status.success() {
            warn!(workspace.id = %workspace.id, "Engine output read failed; treating as empty");
            return Ok(BTreeMap::new());
        }

        // `terraform output -json` shape: { name: { value, type, sensitive } }
        let parsed: BTreeMap<String, Value> = serde_json::from_slice(&output.stdout)?;
        Ok(parsed
            .into_iter()
            .filter_map(|(name, entry)| {
                entry
                    .get("value")
                    .cloned()
                    .map(|value| (name, value))
            })
            .collect())
    }
}

fn dispatch_error(workspace: &Workspace, reason: String) -> BrokerError {
    BrokerError::Dispatch {
        workspace_id: workspace.id.to_string(),
        reason,
    }
}

fn capture_lines(diagnostics: &mut Vec<String>, output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if !line.is_empty() {
            diagnostics.push(line.to_string());
        }
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if !line.is_empty() {
            diagnostics.push(line.to_string());
        }
    }
}

#[async_trait]
impl EngineRunner for TerraformRunner {
    async fn run(
        &self,
        workspace: &Workspace,
        kind: OperationKind,
    ) -> Result<RunOutcome, BrokerError> {
        let dir = self.prepare_dir(workspace).await?;
        let mut diagnostics = Vec::new();

        let init = self
            .engine_command(&dir, &["init", "-no-color", "-input=false"], workspace)
            .await?;
        capture_lines(&mut diagnostics, &init);
        if !init.status.success() {
            return Ok(RunOutcome {
                success: false,
                diagnostics,
                outputs: BTreeMap::new(),
            });
        }

        let verb = match kind {
            OperationKind::Apply => "apply",
            OperationKind::Destroy => "destroy",
        };
        let run = self
            .engine_command(
                &dir,
                &[verb, "-no-color", "-input=false", "-auto-approve"],
                workspace,
            )
            .await?;
        capture_lines(&mut diagnostics, &run);
        if !run.status.success() {
            return Ok(RunOutcome {
                success: false,
                diagnostics,
                outputs: BTreeMap::new(),
            });
        }

        let outputs = match kind {
            OperationKind::Apply => self.read_outputs(&dir, workspace).await?,
            OperationKind::Destroy => BTreeMap::new(),
        };

        Ok(RunOutcome {
            success: true,
            diagnostics,
            outputs,
        })
    }
}
