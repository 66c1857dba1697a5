use anyhow::Result;

use tf_broker::config::TfBrokerConfig;
use tf_broker::telemetry::{init_telemetry, shutdown_telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    TfBrokerConfig::load_env_file()?;
    let config = TfBrokerConfig::load()?;
    init_telemetry(&config.observability.log_level)?;

    let result = tf_broker::cli::run(config).await;

    shutdown_telemetry();
    result
}
