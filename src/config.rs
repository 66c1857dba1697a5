use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TfBrokerConfig {
    /// External provisioning engine settings
    pub engine: EngineConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Durable state store settings
    pub database: DatabaseConfig,
    /// Service definition to serve (templates for provision/bind)
    pub service_definition_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Name or path of the engine binary (resolved via PATH when bare)
    pub binary: String,
    /// Root directory under which per-workspace run directories are created
    pub work_dir: String,
    /// Interval between execution-state polls while waiting
    pub poll_interval_seconds: u64,
    /// Local bound on a single wait call; the remote run is not cancelled
    pub operation_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for TfBrokerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                binary: "terraform".to_string(),
                work_dir: ".tf-broker/workspaces".to_string(),
                poll_interval_seconds: 2,
                operation_timeout_seconds: 1800, // 30 minutes
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
            },
            database: DatabaseConfig {
                url: ".tf-broker/tf-broker.db".to_string(),
                auto_migrate: true,
            },
            service_definition_path: None,
        }
    }
}

impl TfBrokerConfig {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration file (tf-broker.toml)
    /// 3. Environment variables (prefixed with TF_BROKER_)
    pub fn load() -> Result<Self> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&TfBrokerConfig::default())?);

        if Path::new("tf-broker.toml").exists() {
            builder = builder.add_source(File::with_name("tf-broker"));
        }

        builder = builder.add_source(
            Environment::with_prefix("TF_BROKER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let loaded: TfBrokerConfig = config.try_deserialize()?;

        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = TfBrokerConfig::default();
        assert_eq!(config.engine.binary, "terraform");
        assert!(config.engine.operation_timeout_seconds > 0);
        assert!(config.database.auto_migrate);
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("TF_BROKER_ENGINE__BINARY", "tofu");
        let config = TfBrokerConfig::load().unwrap();
        std::env::remove_var("TF_BROKER_ENGINE__BINARY");

        assert_eq!(config.engine.binary, "tofu");
        // Untouched sections keep their defaults.
        assert_eq!(config.database.url, TfBrokerConfig::default().database.url);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = TfBrokerConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: TfBrokerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine.binary, config.engine.binary);
        assert_eq!(parsed.database.url, config.database.url);
    }
}
