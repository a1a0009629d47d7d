//! # Agentcell — durable task orchestration for stateful agents
//!
//! Starts the HTTP gateway with the built-in agent types registered.
//! Every `(agent type, instance key)` pair owns its own SQLite-backed task
//! queue, log store, and alarm.
//!
//! Usage:
//!   agentcell                          # Start gateway (default port 8787)
//!   agentcell --port 9000              # Custom port
//!   agentcell --data-dir ""            # In-memory stores, nothing on disk

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use agentcell_core::CellConfig;
use agentcell_registry::{AgentDescriptor, AgentRegistry};
use agentcell_scheduler::{Task, TaskHandler};

#[derive(Parser)]
#[command(name = "agentcell", version, about = "Durable task orchestration for stateful agents")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "~/.agentcell/config.toml")]
    config: String,

    /// Gateway port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Instance database directory (overrides config; empty = in-memory)
    #[arg(long)]
    data_dir: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Built-in demo agent: completes every task by echoing its payload back
/// as the result.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &Task) -> agentcell_core::Result<serde_json::Value> {
        tracing::info!(task = %task.id, name = %task.name, "echo task executed");
        Ok(serde_json::json!({"echo": task.payload}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "agentcell=debug,tower_http=debug"
    } else {
        "agentcell=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = PathBuf::from(shellexpand::tilde(&cli.config).to_string());
    let mut config = CellConfig::load_or_default(&config_path)?;
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    let data_dir = config.data_dir();
    match &data_dir {
        Some(dir) => tracing::info!("Instance databases in {}", dir.display()),
        None => tracing::info!("In-memory stores (no data directory configured)"),
    }

    let mut registry = AgentRegistry::new(data_dir);
    registry.register(
        AgentDescriptor {
            agent_type: "echo".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Echoes task payloads back as results".into(),
            tools: vec!["echo".into()],
        },
        Arc::new(EchoHandler),
    );

    agentcell_gateway::serve(&config.gateway, Arc::new(registry)).await
}
