use crate::backend::SupervisorStatus;
use crate::session::SessionStatus;
use serde::Serialize;
use sonar_mcp_protocol::ServerIdentity;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub plugins_dir: PathBuf,
    pub bridge_dir: PathBuf,
    pub plugins: Vec<String>,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatusOutput {
    pub schema_version: u32,
    pub server: ServerIdentity,
    pub backend: SupervisorStatus,
    pub session: SessionStatus,
    pub plugins: PluginSummary,
}
