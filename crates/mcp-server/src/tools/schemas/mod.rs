//! Argument and result shapes of the MCP tools.

pub(crate) mod analyze;
pub(crate) mod profile;
pub(crate) mod rules;
pub(crate) mod status;
