// tf-broker - workspace orchestration for marketplace service provisioning
// This exposes the core components for testing and integration

pub mod brokerpak;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod provider;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod vars;
pub mod workspace;

// Re-export key types for easy access
pub use config::TfBrokerConfig;
pub use correlation::{operation_span, CorrelationId};
pub use engine::{
    cancellation_pair, CancelHandle, CancelToken, Dispatcher, EngineRunner, ExecutionHandle,
    Monitor, RunOutcome, TerraformRunner,
};
pub use error::BrokerError;
pub use provider::{ServiceDefinition, TeardownOutcome, TfProvider};
pub use store::{MemoryStore, SqliteStore, StateStore, StoreError};
pub use telemetry::{init_telemetry, shutdown_telemetry};
pub use template::{TemplateDefinition, TemplateStore};
pub use vars::{VarContext, VarContextBuilder};
pub use workspace::{
    BindingRecord, BindingState, Execution, ExecutionState, InstanceRecord, InstanceState,
    OperationKind, OperationType, Workspace, WorkspaceId,
};
