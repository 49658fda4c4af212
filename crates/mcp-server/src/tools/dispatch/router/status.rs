use super::super::SonarMcpService;
use super::json_result;
use crate::tools::schemas::status::{BackendStatusOutput, PluginSummary};
use rmcp::model::CallToolResult;
use sonar_mcp_protocol::{ServerIdentity, STATUS_SCHEMA_VERSION};

pub(in crate::tools::dispatch) fn backend_status(service: &SonarMcpService) -> CallToolResult {
    let supervisor = service.supervisor();
    let plugins = supervisor.plugins();
    json_result(&BackendStatusOutput {
        schema_version: STATUS_SCHEMA_VERSION,
        server: ServerIdentity {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        backend: supervisor.status(),
        session: service.session().status(),
        plugins: PluginSummary {
            plugins_dir: plugins.plugins_dir.clone(),
            bridge_dir: plugins.bridge_dir.clone(),
            plugins: plugins.plugins.iter().map(|p| p.key.clone()).collect(),
            languages: supervisor.languages(),
        },
    })
}
