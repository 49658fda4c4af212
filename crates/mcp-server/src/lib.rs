//! Sonar MCP bridge
//!
//! Exposes SonarLint analyzers to AI agents over MCP. The bridge provisions analyzer plugins,
//! supervises a long-lived analysis backend process, and routes MCP tool calls to it through a
//! bounded analysis session.
//!
//! ## Usage
//!
//! Add to your MCP client configuration:
//! ```json
//! {
//!   "mcpServers": {
//!     "sonar": {
//!       "command": "sonar-mcp",
//!       "env": { "STORAGE_PATH": "/var/lib/sonar-mcp" }
//!     }
//!   }
//! }
//! ```

pub mod backend;
pub mod config;
pub mod engine_stub;
pub mod error;
pub mod provision;
pub mod rpc;
pub mod session;
pub mod tools;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use backend::{BackendState, ProcessLauncher, Supervisor};
use clap::{Parser, Subcommand};
use config::{BridgeConfig, ConfigOverrides};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use session::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tools::SonarMcpService;

#[derive(Parser)]
#[command(name = "sonar-mcp")]
#[command(about = "MCP bridge to a supervised SonarLint analysis backend", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Plugins directory (defaults to $STORAGE_PATH/plugins)
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Analysis backend executable
    #[arg(long, global = true)]
    backend_command: Option<PathBuf>,

    /// Analyses allowed to run on the backend at once
    #[arg(long, global = true)]
    max_in_flight: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdio (default)
    Serve,
    /// Resolve plugins and extract the JS/TS bridge bundle, then print the plugin set
    Provision,
    /// Print the tool inventory as JSON
    #[command(name = "print-tools")]
    PrintTools,
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let overrides = ConfigOverrides {
        plugins_dir: cli.plugins_dir,
        backend_command: cli.backend_command,
        max_in_flight: cli.max_in_flight,
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::PrintTools => print_tools(),
        Commands::Provision => {
            let config = load_config(&overrides)?;
            let plugins = provision::resolve_plugins_async(config.plugins_dir.clone())
                .await
                .with_context(|| format!("provisioning {}", config.plugins_dir.display()))?;
            println!("{}", serde_json::to_string_pretty(&plugins)?);
            Ok(())
        }
        Commands::Serve => serve(load_config(&overrides)?).await,
    }
}

fn init_logging() {
    // stdout carries MCP frames; logs go to stderr only.
    let default_filter = if config::logging_enabled() {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();
}

/// Environment first, CLI flags on top. `--plugins-dir` stands in for `STORAGE_PATH`.
fn load_config(overrides: &ConfigOverrides) -> Result<BridgeConfig> {
    let plugins_dir = overrides
        .plugins_dir
        .as_ref()
        .map(|dir| dir.display().to_string());
    let config = BridgeConfig::from_lookup(|key| match (key, plugins_dir.as_ref()) {
        (config::PLUGINS_DIR_ENV, Some(dir)) => Some(dir.clone()),
        _ => std::env::var(key).ok(),
    })?;
    Ok(config.apply_overrides(overrides))
}

fn print_tools() -> Result<()> {
    let mut inventory = tools::catalog::tool_inventory_json(env!("CARGO_PKG_VERSION"));
    let definitions = serde_json::to_value(SonarMcpService::tool_definitions())?;
    if let Some(obj) = inventory.as_object_mut() {
        obj.insert("definitions".to_string(), definitions);
    }
    println!("{}", serde_json::to_string_pretty(&inventory)?);
    Ok(())
}

async fn serve(config: BridgeConfig) -> Result<()> {
    log::info!(
        "Starting Sonar MCP bridge (plugins: {})",
        config.plugins_dir.display()
    );

    // Nothing is served until provisioning succeeds.
    let plugins = provision::resolve_plugins_async(config.plugins_dir.clone())
        .await
        .with_context(|| format!("provisioning {}", config.plugins_dir.display()))?;
    log::info!(
        "Provisioned {} plugin(s); languages: {}",
        plugins.plugins.len(),
        plugins.languages.join(", ")
    );

    let supervisor = Supervisor::new(
        config.supervisor.clone(),
        Arc::new(ProcessLauncher::new(config.backend.clone())),
        plugins,
    );
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.start().await {
                log::error!("analysis backend did not start: {err}");
            }
        });
    }

    let service = SonarMcpService::new(SessionManager::new(
        supervisor.clone(),
        config.session.clone(),
    ));
    let server = service.serve(stdio()).await?;

    let mut states = supervisor.subscribe();
    let backend_stopped = async move {
        if states
            .wait_for(|state| *state == BackendState::Stopped)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    };

    let mut waiting = Box::pin(server.waiting());
    tokio::pin!(backend_stopped);
    let mut hangups = hangups();

    let outcome = loop {
        tokio::select! {
            result = &mut waiting => break result.map(|_| ()).map_err(anyhow::Error::from),
            _ = &mut backend_stopped => {
                break Err(anyhow::anyhow!("analysis backend stopped permanently"))
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted; shutting down");
                break Ok(());
            }
            _ = next_hangup(&mut hangups) => {
                log::info!("SIGHUP received; re-provisioning plugins");
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    match supervisor.reprovision().await {
                        Ok(plugins) => log::info!(
                            "Re-provisioned {} plugin(s); languages: {}",
                            plugins.plugins.len(),
                            plugins.languages.join(", ")
                        ),
                        Err(err) => log::error!("re-provisioning failed: {err}"),
                    }
                });
            }
        }
    };
    // Dropping the running service ends the MCP session.
    drop(waiting);

    supervisor.stop().await;
    log::info!("Sonar MCP bridge stopped");
    outcome
}

#[cfg(unix)]
type Hangups = Option<tokio::signal::unix::Signal>;

#[cfg(unix)]
fn hangups() -> Hangups {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(signal) => Some(signal),
        Err(err) => {
            log::warn!("SIGHUP re-provisioning unavailable: {err}");
            None
        }
    }
}

/// Resolves on each SIGHUP.
#[cfg(unix)]
async fn next_hangup(hangups: &mut Hangups) {
    if let Some(signal) = hangups.as_mut() {
        if signal.recv().await.is_some() {
            return;
        }
        *hangups = None;
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
type Hangups = ();

#[cfg(not(unix))]
fn hangups() -> Hangups {}

#[cfg(not(unix))]
async fn next_hangup(_hangups: &mut Hangups) {
    std::future::pending::<()>().await
}
