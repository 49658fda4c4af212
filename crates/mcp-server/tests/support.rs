#![allow(dead_code)]

use anyhow::{Context, Result};
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::{RoleClient, RunningService, ServiceExt};
use rmcp::transport::TokioChildProcess;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

pub type Client = RunningService<RoleClient, ()>;

pub fn locate_bin(name: &str) -> Result<PathBuf> {
    let compiled = match name {
        "sonar-mcp" => option_env!("CARGO_BIN_EXE_sonar-mcp"),
        "sonar-mcp-engine-stub" => option_env!("CARGO_BIN_EXE_sonar-mcp-engine-stub"),
        _ => None,
    };
    if let Some(path) = compiled {
        return Ok(PathBuf::from(path));
    }

    // `.../target/{debug|release}/deps/<test>` → `.../target/{debug|release}/<name>`
    if let Ok(exe) = std::env::current_exe() {
        if let Some(target_profile_dir) = exe.parent().and_then(|p| p.parent()) {
            let candidate = target_profile_dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let repo_root = manifest_dir
        .ancestors()
        .nth(2)
        .context("failed to resolve repo root from CARGO_MANIFEST_DIR")?;
    for profile in ["debug", "release"] {
        let candidate = repo_root.join("target").join(profile).join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    anyhow::bail!("failed to locate {name}; build with: cargo build -p sonar-mcp --bins")
}

/// Storage root whose plugins directory already holds an extracted JS/TS bridge.
pub fn storage_fixture() -> Result<tempfile::TempDir> {
    let storage = tempfile::tempdir().context("tempdir")?;
    let plugins = storage.path().join("plugins");
    let bridge = plugins.join("eslint-bridge");
    std::fs::create_dir_all(&bridge).context("mkdir eslint-bridge")?;
    std::fs::write(plugins.join("sonar-javascript-plugin-10.5.0.jar"), b"jar")
        .context("write js plugin")?;
    std::fs::write(plugins.join("sonar-java-plugin-8.1.0.jar"), b"jar")
        .context("write java plugin")?;
    std::fs::write(bridge.join(".sonar-mcp-extracted"), b"fixture\n").context("write marker")?;
    Ok(storage)
}

/// Bridge command wired to the stub engine with fast supervision timings.
pub fn bridge_command(storage: &Path) -> Result<Command> {
    let mut cmd = Command::new(locate_bin("sonar-mcp")?);
    cmd.env("STORAGE_PATH", storage)
        .env_remove("SONAR_MCP_PLUGINS_DIR")
        .env("SONAR_MCP_BACKEND_COMMAND", locate_bin("sonar-mcp-engine-stub")?)
        .env("SONAR_MCP_HEARTBEAT_INTERVAL_MS", "100")
        .env("SONAR_MCP_HEARTBEAT_TIMEOUT_MS", "100")
        .env("SONAR_MCP_RESTART_BACKOFF_MIN_MS", "20")
        .env("SONAR_MCP_RESTART_BACKOFF_MAX_MS", "200")
        .env("SONAR_MCP_SHUTDOWN_GRACE_MS", "200")
        .env("RUST_LOG", "warn");
    Ok(cmd)
}

pub async fn connect(cmd: Command) -> Result<Client> {
    let transport = TokioChildProcess::new(cmd).context("spawn sonar-mcp")?;
    tokio::time::timeout(Duration::from_secs(10), ().serve(transport))
        .await
        .context("timeout starting MCP server")?
        .context("MCP handshake")
}

pub async fn call(client: &Client, tool: &str, args: Value) -> Result<CallToolResult> {
    let result = tokio::time::timeout(
        Duration::from_secs(20),
        client.call_tool(CallToolRequestParam {
            name: tool.to_string().into(),
            arguments: args.as_object().cloned(),
        }),
    )
    .await
    .with_context(|| format!("timeout calling {tool}"))??;
    Ok(result)
}

pub fn structured(result: &CallToolResult) -> Result<&Value> {
    result
        .structured_content
        .as_ref()
        .context("tool result missing structured_content")
}

pub fn error_code(result: &CallToolResult) -> Option<&str> {
    result
        .structured_content
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
}

/// Polls `backend_status` until the backend reports `state`.
pub async fn wait_for_state(client: &Client, state: &str) -> Result<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let status = call(client, "backend_status", serde_json::json!({})).await?;
        let value = structured(&status)?.clone();
        if value["backend"]["state"] == state {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("backend never reached {state}; last status: {value}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
