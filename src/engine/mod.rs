//! Engine orchestration: dispatching runs of the external provisioning
//! engine and monitoring them to a terminal state.

pub mod dispatcher;
pub mod mocks;
pub mod monitor;
pub mod runner;

pub use dispatcher::{Dispatcher, ExecutionHandle};
pub use monitor::{cancellation_pair, CancelHandle, CancelToken, Monitor};
pub use runner::{EngineRunner, RunOutcome, TerraformRunner};
