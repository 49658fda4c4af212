//! Sonar MCP tool surface.
//!
//! Schemas, semantic validation and dispatch live in separate submodules; every tool call goes
//! through the session manager before it reaches the backend.

pub(crate) mod catalog;
mod dispatch;
mod schemas;
mod validate;

pub use dispatch::SonarMcpService;
