//! MCP tool dispatch for the Sonar bridge.
//!
//! Every tool call becomes a [`ToolInvocation`] carrying the MCP request id, a clamped deadline
//! and the client's cancellation token, and is answered with either a JSON result or an error
//! envelope. Tool failures never surface as JSON-RPC errors.

mod router;
#[cfg(test)]
mod tests;
mod tool_router_hints;

use super::catalog;
use crate::backend::Supervisor;
use crate::session::{SessionManager, ToolInvocation};
use rmcp::model::{
    Implementation, NumberOrString, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{tool_handler, ServerHandler};
use tool_router_hints::ToolRouterWithParamHints;

#[derive(Clone)]
pub struct SonarMcpService {
    tool_router: ToolRouterWithParamHints<Self>,
    session: SessionManager,
}

impl SonarMcpService {
    pub fn new(session: SessionManager) -> Self {
        Self {
            tool_router: router::build_tool_router_with_param_hints(),
            session,
        }
    }

    /// Tool definitions as published through `tools/list`; needs no backend.
    pub fn tool_definitions() -> Vec<Tool> {
        router::build_tool_router_with_param_hints().list_all()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn supervisor(&self) -> &Supervisor {
        self.session.supervisor()
    }

    fn invocation(
        &self,
        tool_name: &str,
        context: &RequestContext<RoleServer>,
        timeout_ms: Option<u64>,
    ) -> ToolInvocation {
        let request_id = match &context.id {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::String(s) => s.to_string(),
        };
        ToolInvocation::new(
            tool_name,
            request_id,
            self.session.config().clamp_timeout(timeout_ms),
            context.ct.clone(),
        )
    }
}

#[tool_handler]
impl ServerHandler for SonarMcpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(catalog::tool_instructions()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}
