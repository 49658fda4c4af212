//! Lifecycle of the analysis engine subprocess.

mod launcher;
mod supervisor;

pub use launcher::{BackendCommand, BackendLauncher, BackendProcess, LaunchedBackend, ProcessLauncher};
pub use supervisor::{
    BackendState, EngineInfo, StateTransition, Supervisor, SupervisorConfig, SupervisorStatus,
};
