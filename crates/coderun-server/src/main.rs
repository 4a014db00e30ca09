//! coderun server binary
//!
//! Loads configuration, connects to the local Docker daemon once and serves
//! the execution endpoints until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use coderun_api::{shutdown_signal, CoderunServer, ServerConfig};
use coderun_core::config::Environment;
use coderun_core::{CoderunConfig, ConfigLoader, DockerRuntime, SessionOrchestrator};
use env_logger::Env;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "coderun-server")]
#[command(about = "Runs untrusted code snippets in disposable containers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    overrides: Overrides,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, short, global = true, default_value = "info")]
    log_level: String,
}

/// Settings that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// YAML configuration file; built-in defaults are used when omitted
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// API server port
    #[arg(long, short, global = true)]
    port: Option<u16>,

    /// Environment (development|staging|production)
    #[arg(long = "env", global = true)]
    environment: Option<Environment>,

    /// Per-execution deadline in seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    /// Container image every session runs in
    #[arg(long, global = true)]
    image: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API server (default command)
    Run,
    /// Print the effective configuration as YAML
    Config,
    /// Check that the Docker daemon is reachable
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();

    let config = load_config(&cli.overrides).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Ping => {
            let runtime = DockerRuntime::connect_with_local_defaults()?;
            runtime.ping().await.context("Docker daemon is not reachable")?;
            println!("Docker daemon is reachable");
            Ok(())
        }
    }
}

async fn load_config(overrides: &Overrides) -> Result<CoderunConfig> {
    let mut config = match &overrides.config {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            ConfigLoader::from_file(path).await?
        }
        None => CoderunConfig::default(),
    };
    apply_overrides(&mut config, overrides);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut CoderunConfig, overrides: &Overrides) {
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(environment) = overrides.environment {
        config.server.environment = environment;
    }
    if let Some(deadline_secs) = overrides.deadline_secs {
        config.execution.deadline_secs = deadline_secs;
    }
    if let Some(image) = &overrides.image {
        config.runtime.image = image.clone();
    }
}

async fn run_server(config: CoderunConfig) -> Result<()> {
    let runtime = DockerRuntime::connect_with_local_defaults()
        .context("Failed to connect to the Docker daemon")?;
    // The daemon may come up later; sessions fail individually until it does.
    if let Err(e) = runtime.ping().await {
        log::warn!("Docker daemon did not answer ping: {}", e);
    }

    let orchestrator = Arc::new(SessionOrchestrator::new(Arc::new(runtime), &config));
    log::info!("Session orchestrator ready: {:?}", orchestrator);

    let server_config = ServerConfig::from_settings(&config.server)?;
    CoderunServer::with_config(orchestrator, server_config)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
