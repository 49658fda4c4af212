use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sonar_mcp::main_entry().await
}
