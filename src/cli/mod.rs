//! Command-line entry points.
//!
//! The CLI drives the lifecycle facade directly; the marketplace HTTP
//! surface sits outside this crate and talks to the same facade.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::TfBrokerConfig;
use crate::engine::{CancelToken, TerraformRunner};
use crate::provider::{ServiceDefinition, TeardownOutcome, TfProvider};
use crate::store::SqliteStore;
use crate::vars::VarContext;

#[derive(Parser)]
#[command(name = "tf-broker")]
#[command(about = "Workspace orchestration for marketplace service provisioning")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the service definition file (overrides configuration)
    #[arg(long)]
    service_definition: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a service instance
    Provision {
        /// Instance GUID
        instance: String,
        /// Operation variables as key=value pairs
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },
    /// Destroy a provisioned service instance
    Deprovision {
        /// Instance GUID
        instance: String,
    },
    /// Create a binding against a provisioned instance
    Bind {
        /// Instance GUID
        instance: String,
        /// Binding ID
        binding: String,
        /// Operation variables as key=value pairs
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },
    /// Destroy a binding
    Unbind {
        /// Instance GUID
        instance: String,
        /// Binding ID
        binding: String,
    },
    /// Show the most recent execution for an instance or binding
    Status {
        /// Instance GUID
        instance: String,
        /// Binding ID (omit for instance-level operations)
        #[arg(long)]
        binding: Option<String>,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn vars_from_pairs(pairs: &[(String, String)]) -> VarContext {
    let mut builder = VarContext::builder();
    for (key, value) in pairs {
        builder = builder.set(key, value.as_str());
    }
    builder.build()
}

async fn load_service_definition(
    config: &TfBrokerConfig,
    override_path: Option<&PathBuf>,
) -> Result<ServiceDefinition> {
    let path = override_path
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| config.service_definition_path.clone())
        .context("no service definition configured (set service_definition_path or pass --service-definition)")?;

    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading service definition {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing service definition {path}"))
}

pub async fn run(config: TfBrokerConfig) -> Result<()> {
    let cli = Cli::parse();

    let store = Arc::new(
        SqliteStore::new(&config.database.url, config.database.auto_migrate)
            .await
            .context("opening state store")?,
    );
    let runner = Arc::new(TerraformRunner::discover(&config.engine)?);
    let service = load_service_definition(&config, cli.service_definition.as_ref()).await?;

    let provider = TfProvider::new(
        store,
        runner,
        service,
        Duration::from_secs(config.engine.poll_interval_seconds),
        Duration::from_secs(config.engine.operation_timeout_seconds),
    );

    match cli.command {
        Commands::Provision { instance, vars } => {
            let outputs = provider
                .provision(&instance, &vars_from_pairs(&vars), CancelToken::noop())
                .await?;
            print_outputs(&outputs);
        }
        Commands::Deprovision { instance } => {
            match provider.deprovision(&instance, CancelToken::noop()).await? {
                TeardownOutcome::Destroyed => println!("instance {instance} deprovisioned"),
                TeardownOutcome::AlreadyGone => println!("instance {instance} was already gone"),
            }
        }
        Commands::Bind {
            instance,
            binding,
            vars,
        } => {
            let credentials = provider
                .bind(
                    &instance,
                    &binding,
                    &vars_from_pairs(&vars),
                    CancelToken::noop(),
                )
                .await?;
            print_outputs(&credentials);
        }
        Commands::Unbind { instance, binding } => {
            match provider
                .unbind(&instance, &binding, CancelToken::noop())
                .await?
            {
                TeardownOutcome::Destroyed => println!("binding {binding} destroyed"),
                TeardownOutcome::AlreadyGone => println!("binding {binding} was already gone"),
            }
        }
        Commands::Status { instance, binding } => {
            match provider.status(&instance, binding.as_deref()).await? {
                Some(execution) => {
                    println!(
                        "{} {} ({}, started {})",
                        execution.id, execution.state, execution.operation, execution.started_at
                    );
                    for line in &execution.diagnostics {
                        println!("  {line}");
                    }
                }
                None => println!("no executions recorded"),
            }
        }
    }

    Ok(())
}

fn print_outputs(outputs: &std::collections::BTreeMap<String, Value>) {
    if outputs.is_empty() {
        println!("(no outputs)");
        return;
    }
    for (key, value) in outputs {
        println!("{key} = {value}");
    }
}
