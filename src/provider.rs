//! Lifecycle facade.
//!
//! The four public operations each run the same fixed pipeline: render the
//! workspace from the service definition's template and the operation's
//! variable context, dispatch the engine run, and wait for its terminal
//! state. Lifecycle transitions are driven only by terminal execution
//! states; a failed run restores the resource's prior stable state and
//! records the failure instead of advancing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn, Instrument};

use crate::correlation::{operation_span, CorrelationId};
use crate::engine::{CancelToken, Dispatcher, EngineRunner, ExecutionHandle, Monitor};
use crate::error::BrokerError;
use crate::store::StateStore;
use crate::template::{TemplateDefinition, TemplateStore};
use crate::vars::VarContext;
use crate::workspace::{
    BindingRecord, BindingState, Execution, InstanceRecord, InstanceState, OperationType,
    WorkspaceId,
};

/// Templates for one marketplace service: provision settings drive
/// provision/deprovision workspaces, bind settings drive bind/unbind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub provision_settings: TemplateDefinition,
    pub bind_settings: TemplateDefinition,
}

/// Result of a deprovision or unbind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Destroyed,
    /// The resource was already gone; the call was a no-op.
    AlreadyGone,
}

pub struct TfProvider {
    store: Arc<dyn StateStore>,
    templates: TemplateStore,
    dispatcher: Dispatcher,
    monitor: Monitor,
    service: ServiceDefinition,
    operation_timeout: Duration,
}

impl TfProvider {
    pub fn new(
        store: Arc<dyn StateStore>,
        runner: Arc<dyn EngineRunner>,
        service: ServiceDefinition,
        poll_interval: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            templates: TemplateStore::new(Arc::clone(&store)),
            dispatcher: Dispatcher::new(Arc::clone(&store), runner),
            monitor: Monitor::new(Arc::clone(&store), poll_interval),
            store,
            service,
            operation_timeout,
        }
    }

    /// Provision a service instance; on success the engine's outputs are
    /// stored as instance state for later binds and returned to the caller.
    pub async fn provision(
        &self,
        instance_guid: &str,
        params: &VarContext,
        cancel: CancelToken,
    ) -> Result<BTreeMap<String, Value>, BrokerError> {
        let correlation_id = CorrelationId::derive(instance_guid, "", OperationType::Provision);
        let workspace_id = WorkspaceId::for_instance(instance_guid);
        let span = operation_span(OperationType::Provision, &correlation_id, &workspace_id);
        self.provision_inner(instance_guid, params, cancel, correlation_id, workspace_id)
            .instrument(span)
            .await
    }

    async fn provision_inner(
        &self,
        instance_guid: &str,
        params: &VarContext,
        cancel: CancelToken,
        correlation_id: CorrelationId,
        workspace_id: WorkspaceId,
    ) -> Result<BTreeMap<String, Value>, BrokerError> {
        let prior = self.store.load_instance(instance_guid).await?;

        let vars = VarContext::builder()
            .set("instance_id", instance_guid)
            .merge_context(params)
            .build();

        self.templates
            .update_workspace_hcl(&workspace_id, &self.service.provision_settings, &vars)
            .await?;

        let handle = self
            .dispatcher
            .dispatch(&workspace_id, OperationType::Provision.kind(), &correlation_id)
            .await?;

        self.save_instance(instance_guid, InstanceState::Provisioning, prior.as_ref(), None)
            .await?;

        match self.wait(&handle, cancel).await {
            Ok(execution) => {
                let record = InstanceRecord {
                    instance_guid: instance_guid.to_string(),
                    state: InstanceState::Provisioned,
                    outputs: execution.outputs.clone(),
                    last_failure: None,
                    updated_at: Utc::now(),
                };
                self.store.save_instance(&record).await?;
                info!(instance.guid = instance_guid, "Instance provisioned");
                Ok(execution.outputs)
            }
            Err(e) => {
                self.record_instance_failure(instance_guid, prior, &e).await;
                Err(e)
            }
        }
    }

    /// Destroy a provisioned instance. Calling against an instance that was
    /// never provisioned, or was already deprovisioned, is a no-op.
    pub async fn deprovision(
        &self,
        instance_guid: &str,
        cancel: CancelToken,
    ) -> Result<TeardownOutcome, BrokerError> {
        let correlation_id = CorrelationId::derive(instance_guid, "", OperationType::Deprovision);
        let workspace_id = WorkspaceId::for_instance(instance_guid);
        let span = operation_span(OperationType::Deprovision, &correlation_id, &workspace_id);
        self.deprovision_inner(instance_guid, cancel, correlation_id, workspace_id)
            .instrument(span)
            .await
    }

    async fn deprovision_inner(
        &self,
        instance_guid: &str,
        cancel: CancelToken,
        correlation_id: CorrelationId,
        workspace_id: WorkspaceId,
    ) -> Result<TeardownOutcome, BrokerError> {
        let prior = match self.store.load_instance(instance_guid).await? {
            None => {
                info!(instance.guid = instance_guid, "Instance already gone; nothing to deprovision");
                return Ok(TeardownOutcome::AlreadyGone);
            }
            Some(record) if record.state == InstanceState::Deprovisioned => {
                info!(instance.guid = instance_guid, "Instance already deprovisioned");
                return Ok(TeardownOutcome::AlreadyGone);
            }
            Some(record) => record,
        };

        // The stored instance outputs are the variables for the destroy
        // render, so the workspace matches what was applied.
        let vars = VarContext::builder()
            .set("instance_id", instance_guid)
            .merge_map(&prior.outputs)
            .build();

        self.templates
            .update_workspace_hcl(&workspace_id, &self.service.provision_settings, &vars)
            .await?;

        let handle = self
            .dispatcher
            .dispatch(
                &workspace_id,
                OperationType::Deprovision.kind(),
                &correlation_id,
            )
            .await?;

        self.save_instance(
            instance_guid,
            InstanceState::Deprovisioning,
            Some(&prior),
            None,
        )
        .await?;

        match self.wait(&handle, cancel).await {
            Ok(_) => {
                self.save_instance(instance_guid, InstanceState::Deprovisioned, Some(&prior), None)
                    .await?;
                info!(instance.guid = instance_guid, "Instance deprovisioned");
                Ok(TeardownOutcome::Destroyed)
            }
            Err(e) => {
                self.record_instance_failure(instance_guid, Some(prior), &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Create a binding against a provisioned instance; returns the binding
    /// credentials produced by the engine. The instance's stored outputs are
    /// merged into the bind-time variable context.
    pub async fn bind(
        &self,
        instance_guid: &str,
        binding_id: &str,
        params: &VarContext,
        cancel: CancelToken,
    ) -> Result<BTreeMap<String, Value>, BrokerError> {
        let correlation_id = CorrelationId::derive(instance_guid, binding_id, OperationType::Bind);
        let workspace_id = WorkspaceId::for_binding(instance_guid, binding_id);
        let span = operation_span(OperationType::Bind, &correlation_id, &workspace_id);
        self.bind_inner(
            instance_guid,
            binding_id,
            params,
            cancel,
            correlation_id,
            workspace_id,
        )
        .instrument(span)
        .await
    }

    async fn bind_inner(
        &self,
        instance_guid: &str,
        binding_id: &str,
        params: &VarContext,
        cancel: CancelToken,
        correlation_id: CorrelationId,
        workspace_id: WorkspaceId,
    ) -> Result<BTreeMap<String, Value>, BrokerError> {
        let instance = match self.store.load_instance(instance_guid).await? {
            Some(record) if record.state == InstanceState::Provisioned => record,
            Some(record) => {
                return Err(BrokerError::Dispatch {
                    workspace_id: workspace_id.to_string(),
                    reason: format!(
                        "instance {} is {}, not provisioned",
                        instance_guid,
                        record.state.as_str()
                    ),
                });
            }
            None => {
                return Err(BrokerError::Dispatch {
                    workspace_id: workspace_id.to_string(),
                    reason: format!("instance {instance_guid} does not exist"),
                });
            }
        };

        let prior = self.store.load_binding(instance_guid, binding_id).await?;

        let vars = VarContext::builder()
            .set("instance_id", instance_guid)
            .set("binding_id", binding_id)
            .merge_map(&instance.outputs)
            .merge_context(params)
            .build();

        self.templates
            .update_workspace_hcl(&workspace_id, &self.service.bind_settings, &vars)
            .await?;

        let handle = self
            .dispatcher
            .dispatch(&workspace_id, OperationType::Bind.kind(), &correlation_id)
            .await?;

        self.save_binding(
            instance_guid,
            binding_id,
            BindingState::Binding,
            prior.as_ref(),
            None,
        )
        .await?;

        match self.wait(&handle, cancel).await {
            Ok(execution) => {
                let record = BindingRecord {
                    instance_guid: instance_guid.to_string(),
                    binding_id: binding_id.to_string(),
                    state: BindingState::Bound,
                    credentials: execution.outputs.clone(),
                    last_failure: None,
                    updated_at: Utc::now(),
                };
                self.store.save_binding(&record).await?;
                info!(
                    instance.guid = instance_guid,
                    binding.id = binding_id,
                    "Binding created"
                );
                Ok(execution.outputs)
            }
            Err(e) => {
                self.record_binding_failure(instance_guid, binding_id, prior, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Destroy a binding. Re-running unbind against an already-destroyed
    /// binding is a no-op, never corruption.
    pub async fn unbind(
        &self,
        instance_guid: &str,
        binding_id: &str,
        cancel: CancelToken,
    ) -> Result<TeardownOutcome, BrokerError> {
        let correlation_id =
            CorrelationId::derive(instance_guid, binding_id, OperationType::Unbind);
        let workspace_id = WorkspaceId::for_binding(instance_guid, binding_id);
        let span = operation_span(OperationType::Unbind, &correlation_id, &workspace_id);
        self.unbind_inner(instance_guid, binding_id, cancel, correlation_id, workspace_id)
            .instrument(span)
            .await
    }

    async fn unbind_inner(
        &self,
        instance_guid: &str,
        binding_id: &str,
        cancel: CancelToken,
        correlation_id: CorrelationId,
        workspace_id: WorkspaceId,
    ) -> Result<TeardownOutcome, BrokerError> {
        let prior = match self.store.load_binding(instance_guid, binding_id).await? {
            None => {
                info!(
                    instance.guid = instance_guid,
                    binding.id = binding_id,
                    "Binding already gone; nothing to unbind"
                );
                return Ok(TeardownOutcome::AlreadyGone);
            }
            Some(record) if record.state == BindingState::Unbound => {
                info!(
                    instance.guid = instance_guid,
                    binding.id = binding_id,
                    "Binding already unbound"
                );
                return Ok(TeardownOutcome::AlreadyGone);
            }
            Some(record) => record,
        };

        let mut vars = VarContext::builder()
            .set("instance_id", instance_guid)
            .set("binding_id", binding_id);
        if let Some(instance) = self.store.load_instance(instance_guid).await? {
            vars = vars.merge_map(&instance.outputs);
        }
        let vars = vars.merge_map(&prior.credentials).build();

        self.templates
            .update_workspace_hcl(&workspace_id, &self.service.bind_settings, &vars)
            .await?;

        let handle = self
            .dispatcher
            .dispatch(&workspace_id, OperationType::Unbind.kind(), &correlation_id)
            .await?;

        self.save_binding(
            instance_guid,
            binding_id,
            BindingState::Unbinding,
            Some(&prior),
            None,
        )
        .await?;

        match self.wait(&handle, cancel).await {
            Ok(_) => {
                self.save_binding(
                    instance_guid,
                    binding_id,
                    BindingState::Unbound,
                    Some(&prior),
                    None,
                )
                .await?;
                info!(
                    instance.guid = instance_guid,
                    binding.id = binding_id,
                    "Binding destroyed"
                );
                Ok(TeardownOutcome::Destroyed)
            }
            Err(e) => {
                self.record_binding_failure(instance_guid, binding_id, Some(prior), &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Most recent execution for an instance or binding, backing the
    /// marketplace's operation-status polling.
    pub async fn status(
        &self,
        instance_guid: &str,
        binding_id: Option<&str>,
    ) -> Result<Option<Execution>, BrokerError> {
        let workspace_id = match binding_id {
            Some(binding_id) => WorkspaceId::for_binding(instance_guid, binding_id),
            None => WorkspaceId::for_instance(instance_guid),
        };
        Ok(self.store.load_execution(&workspace_id).await?)
    }

    async fn wait(
        &self,
        handle: &ExecutionHandle,
        cancel: CancelToken,
    ) -> Result<Execution, BrokerError> {
        self.monitor.wait(handle, self.operation_timeout, cancel).await
    }

    async fn save_instance(
        &self,
        instance_guid: &str,
        state: InstanceState,
        prior: Option<&InstanceRecord>,
        last_failure: Option<String>,
    ) -> Result<(), BrokerError> {
        let record = InstanceRecord {
            instance_guid: instance_guid.to_string(),
            state,
            outputs: prior.map(|p| p.outputs.clone()).unwrap_or_default(),
            last_failure,
            updated_at: Utc::now(),
        };
        self.store.save_instance(&record).await?;
        Ok(())
    }

    async fn save_binding(
        &self,
        instance_guid: &str,
        binding_id: &str,
        state: BindingState,
        prior: Option<&BindingRecord>,
        last_failure: Option<String>,
    ) -> Result<(), BrokerError> {
        let record = BindingRecord {
            instance_guid: instance_guid.to_string(),
            binding_id: binding_id.to_string(),
            state,
            credentials: prior.map(|p| p.credentials.clone()).unwrap_or_default(),
            last_failure,
            updated_at: Utc::now(),
        };
        self.store.save_binding(&record).await?;
        Ok(())
    }

    /// Restore the prior stable state after a failed run and record the
    /// failure. Timeouts and cancellations leave the in-flight state alone:
    /// the remote run is still going and a later wait can pick it up.
    async fn record_instance_failure(
        &self,
        instance_guid: &str,
        prior: Option<InstanceRecord>,
        error: &BrokerError,
    ) {
        if !matches!(error, BrokerError::ProvisioningFailure { .. }) {
            return;
        }
        let stable_state = prior
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(InstanceState::Provisioning);
        if let Err(e) = self
            .save_instance(
                instance_guid,
                stable_state,
                prior.as_ref(),
                Some(error.to_string()),
            )
            .await
        {
            warn!(
                instance.guid = instance_guid,
                error = %e,
                "Failed to record instance failure"
            );
        }
    }

    async fn record_binding_failure(
        &self,
        instance_guid: &str,
        binding_id: &str,
        prior: Option<BindingRecord>,
        error: &BrokerError,
    ) {
        if !matches!(error, BrokerError::ProvisioningFailure { .. }) {
            return;
        }
        let stable_state = prior
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(BindingState::Binding);
        if let Err(e) = self
            .save_binding(
                instance_guid,
                binding_id,
                stable_state,
                prior.as_ref(),
                Some(error.to_string()),
            )
            .await
        {
            warn!(
                instance.guid = instance_guid,
                binding.id = binding_id,
                error = %e,
                "Failed to record binding failure"
            );
        }
    }
}
