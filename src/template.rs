//! Workspace template rendering.
//!
//! A service definition carries one template per operation family (provision
//! settings, bind settings). Rendering merges the template body with the
//! operation's variable context and persists the result keyed by workspace
//! id, overwriting any prior rendering. Rendering is deterministic: the same
//! definition and variables always produce byte-identical output, which is
//! what makes re-dispatch after a crash safe.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BrokerError;
use crate::store::StateStore;
use crate::vars::VarContext;
use crate::workspace::{Workspace, WorkspaceId};

/// A named, author-supplied declarative configuration fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    /// Template body in the engine's configuration language, with
    /// `{{ variable }}` substitution points.
    pub body: String,
    /// Variables that must be present at render time. Checked up front so a
    /// missing input fails before anything is dispatched.
    #[serde(default)]
    pub required: Vec<String>,
}

pub struct TemplateStore {
    store: Arc<dyn StateStore>,
}

impl TemplateStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Render `definition` against `variables` and persist the result for
    /// `workspace_id`. Fails with a caller-visible error when required
    /// variables are missing or the template is malformed; never retried
    /// internally.
    pub async fn update_workspace_hcl(
        &self,
        workspace_id: &WorkspaceId,
        definition: &TemplateDefinition,
        variables: &VarContext,
    ) -> Result<Workspace, BrokerError> {
        let missing = variables.missing_keys(&definition.required);
        if !missing.is_empty() {
            return Err(BrokerError::MissingVariables {
                workspace_id: workspace_id.to_string(),
                missing,
            });
        }

        let rendered_config = render(workspace_id, definition, variables)?;

        let workspace = Workspace {
            id: workspace_id.clone(),
            template_name: definition.name.clone(),
            rendered_config,
            variables: variables.clone(),
            updated_at: Utc::now(),
        };
        self.store.save_workspace(&workspace).await?;

        debug!(
            workspace.id = %workspace_id,
            template = %definition.name,
            bytes = workspace.rendered_config.len(),
            "Workspace rendered and persisted"
        );

        Ok(workspace)
    }
}

fn render(
    workspace_id: &WorkspaceId,
    definition: &TemplateDefinition,
    variables: &VarContext,
) -> Result<String, BrokerError> {
    let context = tera::Context::from_serialize(variables.to_map()).map_err(|source| {
        BrokerError::TemplateRender {
            workspace_id: workspace_id.to_string(),
            source,
        }
    })?;

    tera::Tera::one_off(&definition.body, &context, false).map_err(|source| {
        BrokerError::TemplateRender {
            workspace_id: workspace_id.to_string(),
            source,
        }
    })
}
