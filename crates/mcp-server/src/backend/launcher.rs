use crate::provision::PluginSet;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

/// How to start the analysis engine subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub storage_path: Option<PathBuf>,
}

/// Pipes of a freshly launched backend. `process` is `None` for in-process engines.
pub struct LaunchedBackend {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub process: Option<BackendProcess>,
}

#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, plugins: &PluginSet) -> Result<LaunchedBackend>;
}

/// Spawns the engine as a child in its own process group.
pub struct ProcessLauncher {
    command: BackendCommand,
}

impl ProcessLauncher {
    pub fn new(command: BackendCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self, plugins: &PluginSet) -> Result<LaunchedBackend> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env("SONAR_MCP_PLUGINS_DIR", &plugins.plugins_dir)
            .env("SONAR_MCP_BRIDGE_DIR", &plugins.bridge_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(storage) = self.command.storage_path.as_ref() {
            cmd.env("STORAGE_PATH", storage);
        }

        // Own process group so the whole engine tree (JVM + Node bridge) can be signalled at once;
        // on Linux the engine also dies with us.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn analysis backend {}",
                self.command.program.display()
            )
        })?;
        let pid = child.id().context("backend exited before it could be tracked")?;

        let stdin = child.stdin.take().context("backend stdin not captured")?;
        let stdout = child.stdout.take().context("backend stdout not captured")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(pid, stderr));
        }

        log::info!(
            "launched analysis backend {} (pid {pid})",
            self.command.program.display()
        );
        Ok(LaunchedBackend {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(BackendProcess { pid, child }),
        })
    }
}

async fn forward_stderr(pid: u32, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!(target: "sonar_mcp::engine", "[{pid}] {line}");
    }
}

/// Owned handle to a running engine process group.
pub struct BackendProcess {
    pid: u32,
    child: Child,
}

impl BackendProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// SIGTERM to the group, then SIGKILL once `grace` runs out.
    pub async fn terminate(&mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        signal_group(self.pid, libc::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("analysis backend (pid {}) exited: {status}", self.pid);
                return;
            }
            Ok(Err(err)) => log::warn!("wait for backend (pid {}): {err}", self.pid),
            Err(_) => log::warn!(
                "analysis backend (pid {}) ignored SIGTERM for {}ms; killing",
                self.pid,
                grace.as_millis()
            ),
        }
        signal_group(self.pid, libc::SIGKILL);
        let _ = self.child.wait().await;
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            signal_group(self.pid, libc::SIGKILL);
        }
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    unsafe {
        // setsid() made the child its own group leader, so pgid == pid.
        if libc::killpg(pid, signal) == -1 {
            let _ = libc::kill(pid, signal);
        }
    }
}
