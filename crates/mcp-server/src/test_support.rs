use crate::backend::{BackendLauncher, LaunchedBackend, SupervisorConfig};
use crate::engine_stub::{serve_engine, StubBehavior, StubCounters, DEFAULT_LANGUAGES};
use crate::provision::PluginSet;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cross-test synchronization for process-wide state (env vars, cwd, etc.).
///
/// Rust tests run in parallel by default, but env vars are shared per-process.
/// Any test that mutates or depends on process-wide env should lock this mutex.
pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

const PIPE_CAPACITY: usize = 64 * 1024;

/// Launches in-process stub engines over duplex pipes.
pub(crate) struct StubLauncher {
    sequence: Mutex<VecDeque<StubBehavior>>,
    fallback: StubBehavior,
    /// Launches numbered above this fail to start.
    fail_after: Option<usize>,
    current: Mutex<Option<CancellationToken>>,
    pub(crate) launches: AtomicUsize,
    pub(crate) counters: Arc<StubCounters>,
}

impl StubLauncher {
    pub(crate) fn new(behavior: StubBehavior) -> Self {
        Self::with_sequence(vec![behavior])
    }

    /// One behavior per launch; the last one repeats.
    pub(crate) fn with_sequence(sequence: Vec<StubBehavior>) -> Self {
        let fallback = sequence.last().cloned().unwrap_or_default();
        Self {
            sequence: Mutex::new(sequence.into()),
            fallback,
            fail_after: None,
            current: Mutex::new(None),
            launches: AtomicUsize::new(0),
            counters: Arc::new(StubCounters::default()),
        }
    }

    pub(crate) fn failing_after(successes: usize) -> Self {
        Self {
            fail_after: Some(successes),
            ..Self::new(StubBehavior::default())
        }
    }

    /// Kills the most recently launched engine as if the process died.
    pub(crate) fn crash_current(&self) {
        if let Some(kill) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            kill.cancel();
        }
    }
}

#[async_trait]
impl BackendLauncher for StubLauncher {
    async fn launch(&self, _plugins: &PluginSet) -> Result<LaunchedBackend> {
        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_after.is_some_and(|limit| launch > limit) {
            bail!("stub engine refused to start (launch {launch})");
        }
        let behavior = self
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let (bridge_side, engine_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let kill = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(kill.clone());

        let counters = self.counters.clone();
        tokio::spawn(async move {
            let _ = serve_engine(engine_read, engine_write, behavior, counters, kill).await;
        });

        Ok(LaunchedBackend {
            reader: Box::new(bridge_read),
            writer: Box::new(bridge_write),
            process: None,
        })
    }
}

pub(crate) fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        handshake_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(40),
        heartbeat_misses: 3,
        max_restarts: 3,
        backoff_min: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        request_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(200),
    }
}

/// Plugin set pointing at an existing directory, advertising the stub's languages.
pub(crate) fn stub_plugin_set(dir: &Path) -> PluginSet {
    PluginSet {
        plugins_dir: dir.to_path_buf(),
        plugins: Vec::new(),
        bridge_dir: dir.join("eslint-bridge"),
        languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
    }
}
