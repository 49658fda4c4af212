//! Stand-in analysis engine for integration tests; speaks the backend protocol on stdio.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();
    sonar_mcp::engine_stub::run_stdio_from_env().await
}
