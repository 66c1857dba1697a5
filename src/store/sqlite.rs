//! SQLite-backed state store.
//!
//! The mutual-exclusion invariant lives in a partial unique index over
//! non-terminal execution rows (see migrations/0001_init.sql); a losing
//! concurrent insert surfaces as a unique violation and is mapped to
//! `StoreError::ExecutionInFlight`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::{StateStore, StoreError};
use crate::workspace::{
    BindingRecord, BindingState, Execution, ExecutionState, InstanceRecord, InstanceState,
    OperationKind, Workspace, WorkspaceId,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the store, creating the database and running migrations when
    /// asked.
    pub async fn new(database_url: &str, auto_migrate: bool) -> Result<Self, StoreError> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(sqlx::Error::from)?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully.
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }

    fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
    }

    fn parse_execution_state(raw: &str) -> Result<ExecutionState, StoreError> {
        ExecutionState::parse(raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown execution state {raw:?}")))
    }

    fn parse_operation(raw: &str) -> Result<OperationKind, StoreError> {
        match raw {
            "apply" => Ok(OperationKind::Apply),
            "destroy" => Ok(OperationKind::Destroy),
            other => Err(StoreError::Corrupt(format!(
                "unknown operation kind {other:?}"
            ))),
        }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, StoreError> {
        let state: String = row.get("state");
        let operation: String = row.get("operation");
        let started_at: String = row.get("started_at");
        let finished_at: Option<String> = row.get("finished_at");
        let diagnostics: String = row.get("diagnostics");
        let outputs: String = row.get("outputs");

        Ok(Execution {
            id: row.get("id"),
            workspace_id: WorkspaceId::from_raw(row.get::<String, _>("workspace_id")),
            operation: Self::parse_operation(&operation)?,
            state: Self::parse_execution_state(&state)?,
            started_at: Self::parse_timestamp(&started_at)?,
            finished_at: finished_at
                .as_deref()
                .map(Self::parse_timestamp)
                .transpose()?,
            diagnostics: serde_json::from_str(&diagnostics)?,
            outputs: serde_json::from_str(&outputs)?,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workspaces (id, template_name, rendered_config, variables, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(workspace.id.as_str())
        .bind(&workspace.template_name)
        .bind(&workspace.rendered_config)
        .bind(serde_json::to_string(&workspace.variables)?)
        .bind(workspace.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, template_name, rendered_config, variables, updated_at
            FROM workspaces
            WHERE id = ?1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let variables: String = row.get("variables");
                let updated_at: String = row.get("updated_at");
                Ok(Some(Workspace {
                    id: id.clone(),
                    template_name: row.get("template_name"),
                    rendered_config: row.get("rendered_config"),
                    variables: serde_json::from_str(&variables)?,
                    updated_at: Self::parse_timestamp(&updated_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, workspace_id, operation, state, started_at, finished_at, diagnostics, outputs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&execution.id)
        .bind(execution.workspace_id.as_str())
        .bind(execution.operation.as_str())
        .bind(execution.state.as_str())
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.finished_at.map(|dt| dt.to_rfc3339()))
        .bind(serde_json::to_string(&execution.diagnostics)?)
        .bind(serde_json::to_string(&execution.outputs)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::ExecutionInFlight {
                    workspace_id: execution.workspace_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state = ?1, finished_at = ?2, diagnostics = ?3, outputs = ?4
            WHERE id = ?5 AND state IN ('pending', 'running')
            "#,
        )
        .bind(execution.state.as_str())
        .bind(execution.finished_at.map(|dt| dt.to_rfc3339()))
        .bind(serde_json::to_string(&execution.diagnostics)?)
        .bind(serde_json::to_string(&execution.outputs)?)
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotLive {
                execution_id: execution.id.clone(),
            });
        }

        Ok(())
    }

    async fn load_execution(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workspace_id, operation, state, started_at, finished_at, diagnostics, outputs
            FROM executions
            WHERE workspace_id = ?1
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO instances (instance_guid, state, outputs, last_failure, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&record.instance_guid)
        .bind(record.state.as_str())
        .bind(serde_json::to_string(&record.outputs)?)
        .bind(&record.last_failure)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_instance(
        &self,
        instance_guid: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT instance_guid, state, outputs, last_failure, updated_at
            FROM instances
            WHERE instance_guid = ?1
            "#,
        )
        .bind(instance_guid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let state: String = row.get("state");
                let outputs: String = row.get("outputs");
                let updated_at: String = row.get("updated_at");
                Ok(Some(InstanceRecord {
                    instance_guid: row.get("instance_guid"),
                    state: parse_instance_state(&state)?,
                    outputs: serde_json::from_str(&outputs)?,
                    last_failure: row.get("last_failure"),
                    updated_at: Self::parse_timestamp(&updated_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_binding(&self, record: &BindingRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO bindings (instance_guid, binding_id, state, credentials, last_failure, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.instance_guid)
        .bind(&record.binding_id)
        .bind(record.state.as_str())
        .bind(serde_json::to_string(&record.credentials)?)
        .bind(&record.last_failure)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_binding(
        &self,
        instance_guid: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT instance_guid, binding_id, state, credentials, last_failure, updated_at
            FROM bindings
            WHERE instance_guid = ?1 AND binding_id = ?2
            "#,
        )
        .bind(instance_guid)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let state: String = row.get("state");
                let credentials: String = row.get("credentials");
                let updated_at: String = row.get("updated_at");
                Ok(Some(BindingRecord {
                    instance_guid: row.get("instance_guid"),
                    binding_id: row.get("binding_id"),
                    state: parse_binding_state(&state)?,
                    credentials: serde_json::from_str(&credentials)?,
                    last_failure: row.get("last_failure"),
                    updated_at: Self::parse_timestamp(&updated_at)?,
                }))
            }
            None => Ok(None),
        }
    }
}

fn parse_instance_state(raw: &str) -> Result<InstanceState, StoreError> {
    match raw {
        "provisioning" => Ok(InstanceState::Provisioning),
        "provisioned" => Ok(InstanceState::Provisioned),
        "deprovisioning" => Ok(InstanceState::Deprovisioning),
        "deprovisioned" => Ok(InstanceState::Deprovisioned),
        other => Err(StoreError::Corrupt(format!(
            "unknown instance state {other:?}"
        ))),
    }
}

fn parse_binding_state(raw: &str) -> Result<BindingState, StoreError> {
    match raw {
        "binding" => Ok(BindingState::Binding),
        "bound" => Ok(BindingState::Bound),
        "unbinding" => Ok(BindingState::Unbinding),
        "unbound" => Ok(BindingState::Unbound),
        other => Err(StoreError::Corrupt(format!(
            "unknown binding state {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Execution;
    use chrono::Utc;
    use tempfile::TempDir;

    // A file-backed database: pooled connections against `:memory:` would
    // each see their own empty database.
    async fn open_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}/state.db", dir.path().display());
        let store = SqliteStore::new(&url, true).await.expect("sqlite store");
        (store, dir)
    }

    #[tokio::test]
    async fn workspace_round_trip() {
        let (store, _dir) = open_store().await;
        let workspace = Workspace {
            id: WorkspaceId::for_instance("i1"),
            template_name: "provision".to_string(),
            rendered_config: "resource \"null_resource\" \"db\" {}".to_string(),
            variables: crate::vars::VarContext::builder().set("size", "small").build(),
            updated_at: Utc::now(),
        };

        store.save_workspace(&workspace).await.unwrap();
        let loaded = store
            .load_workspace(&workspace.id)
            .await
            .unwrap()
            .expect("workspace present");
        assert_eq!(loaded.rendered_config, workspace.rendered_config);
        assert_eq!(loaded.variables, workspace.variables);
    }

    #[tokio::test]
    async fn second_inflight_execution_is_refused() {
        let (store, _dir) = open_store().await;
        let workspace_id = WorkspaceId::for_instance("i1");

        let first = Execution::pending(workspace_id.clone(), OperationKind::Apply);
        store.create_execution(&first).await.unwrap();

        let second = Execution::pending(workspace_id.clone(), OperationKind::Apply);
        let err = store.create_execution(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionInFlight { .. }));

        // Once the first run is terminal, a new dispatch may proceed.
        let mut first = first;
        first.mark_failed(vec!["engine exploded".to_string()]);
        store.update_execution(&first).await.unwrap();
        store.create_execution(&second).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_executions_are_immutable() {
        let (store, _dir) = open_store().await;
        let mut execution =
            Execution::pending(WorkspaceId::for_instance("i1"), OperationKind::Destroy);
        store.create_execution(&execution).await.unwrap();

        execution.mark_succeeded(vec![], Default::default());
        store.update_execution(&execution).await.unwrap();

        execution.mark_failed(vec!["should not stick".to_string()]);
        let err = store.update_execution(&execution).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionNotLive { .. }));

        let loaded = store
            .load_execution(&WorkspaceId::for_instance("i1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state, ExecutionState::Succeeded);
    }
}
