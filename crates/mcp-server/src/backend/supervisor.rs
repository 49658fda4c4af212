//! Lifecycle of the analysis backend: launch, handshake, heartbeat, restart, stop.
//!
//! ```text
//! STARTING ──handshake ok──▶ READY ──missed heartbeats / crash / bridge down──▶ DEGRADED
//!     ▲                                                                          │
//!     └──────────────── RESTARTING ◀──────────────── backoff ◀──────────────────┘
//!                           │
//!                           └── restart budget exhausted ──▶ STOPPED (terminal)
//! ```
//!
//! All transitions happen under one async lock; only one restart can be in progress.
//! Heartbeat monitors report failures to a single recovery task, tagged with the generation
//! they watch, so a failure reported by a monitor of a replaced backend is ignored.

use super::launcher::{BackendLauncher, BackendProcess};
use crate::error::BridgeError;
use crate::provision::{resolve_plugins_async, BridgeDirGuard, PluginSet, ProvisionError};
use crate::rpc::{BackendEvent, RpcClient};
use serde::Serialize;
use sonar_mcp_protocol::backend::{
    BridgeHealth, InitializeParams, InitializeResult, BACKEND_PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const TRANSITION_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    Starting,
    Ready,
    Degraded,
    Restarting,
    Stopped,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Degraded => "DEGRADED",
            Self::Restarting => "RESTARTING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Consecutive missed heartbeats before the backend is declared degraded.
    pub heartbeat_misses: u32,
    pub max_restarts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Budget for supervisor-issued calls such as `bridge/restart`.
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(2),
            heartbeat_misses: 3,
            max_restarts: 5,
            backoff_min: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    pub fn normalized(mut self) -> Self {
        if self.backoff_max < self.backoff_min {
            self.backoff_max = self.backoff_min;
        }
        if self.heartbeat_timeout > self.heartbeat_interval {
            self.heartbeat_timeout = self.heartbeat_interval;
        }
        self
    }

    /// `min * 2^(attempt-1)`, capped at `max`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let min_ms = u64::try_from(self.backoff_min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.backoff_max.as_millis()).unwrap_or(u64::MAX);
        let exp = (attempt - 1).min(30);
        Duration::from_millis(min_ms.saturating_mul(1u64 << exp).min(max_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FailureCause {
    MissedHeartbeats(u32),
    ChannelClosed(String),
    BridgeUnreachable,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissedHeartbeats(n) => write!(f, "{n} consecutive heartbeats missed"),
            Self::ChannelClosed(reason) => write!(f, "backend channel closed: {reason}"),
            Self::BridgeUnreachable => f.write_str("JS/TS bridge unreachable after bridge restart"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub state: BackendState,
    pub at_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub engine_version: String,
    pub protocol_version: u32,
    pub languages: Vec<String>,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Point-in-time view for `backend_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: BackendState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    pub restarts: u32,
    pub bridge_restarts: u32,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    pub max_restarts: u32,
    pub transitions: Vec<StateTransition>,
}

#[derive(Default)]
struct Stats {
    restarts: u32,
    bridge_restarts: u32,
    failures: u32,
    last_failure: Option<String>,
    transitions: VecDeque<StateTransition>,
}

/// The live backend. Owned exclusively by the supervisor's lifecycle lock.
struct BackendHandle {
    generation: u64,
    client: RpcClient,
    process: Option<BackendProcess>,
    engine: InitializeResult,
    started_at: Instant,
    _bridge_guard: BridgeDirGuard,
}

#[derive(Clone)]
struct ActiveBackend {
    generation: u64,
    client: RpcClient,
    engine: InitializeResult,
    pid: Option<u32>,
    started_at: Instant,
}

#[derive(Default)]
struct Lifecycle {
    handle: Option<BackendHandle>,
}

type FailureReport = (u64, FailureCause);

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn BackendLauncher>,
    plugins: RwLock<Arc<PluginSet>>,
    state_tx: watch::Sender<BackendState>,
    active: RwLock<Option<ActiveBackend>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    stats: Mutex<Stats>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    failures_tx: mpsc::UnboundedSender<FailureReport>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<FailureReport>>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn BackendLauncher>,
        plugins: PluginSet,
    ) -> Self {
        let (state_tx, _) = watch::channel(BackendState::Starting);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config: config.normalized(),
                launcher,
                plugins: RwLock::new(Arc::new(plugins)),
                state_tx,
                active: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
                stats: Mutex::new(Stats::default()),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
            }),
        }
    }

    pub fn state(&self) -> BackendState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.inner.state_tx.subscribe()
    }

    pub fn plugins(&self) -> Arc<PluginSet> {
        self.inner
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Languages the running engine advertised, falling back to the provisioned plugin set.
    pub fn languages(&self) -> Vec<String> {
        if let Some(active) = self.active() {
            if !active.engine.languages.is_empty() {
                return active.engine.languages;
            }
        }
        self.plugins().languages.clone()
    }

    fn active(&self) -> Option<ActiveBackend> {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_active(&self, active: Option<ActiveBackend>) {
        *self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner) = active;
    }

    fn stats(&self) -> MutexGuard<'_, Stats> {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BackendState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            log::info!("analysis backend {previous} -> {state}");
        }
        let mut stats = self.stats();
        stats.transitions.push_back(StateTransition {
            state,
            at_unix_ms: unix_ms(),
        });
        while stats.transitions.len() > TRANSITION_HISTORY {
            stats.transitions.pop_front();
        }
    }

    /// Client for the live backend. Fails fast unless READY so callers never block on a
    /// channel that is being torn down.
    pub fn client(&self) -> Result<RpcClient, BridgeError> {
        let state = self.state();
        if state != BackendState::Ready {
            return Err(BridgeError::unavailable(format!("analysis backend is {state}")));
        }
        match self.active() {
            Some(active) if !active.client.is_closed() => Ok(active.client),
            _ => Err(BridgeError::unavailable("analysis backend channel is closed")),
        }
    }

    /// Waits until READY. Returns early with an error once the backend is STOPPED.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| matches!(state, BackendState::Ready | BackendState::Stopped)),
        )
        .await;
        let reached = match waited {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => None,
            Err(_) => {
                return Err(BridgeError::unavailable(format!(
                    "analysis backend is {} (not ready after {}ms)",
                    self.state(),
                    timeout.as_millis()
                )))
            }
        };
        match reached {
            Some(BackendState::Ready) => Ok(()),
            _ => Err(BridgeError::unavailable("analysis backend is STOPPED")),
        }
    }

    /// Launches the backend and completes the handshake. On failure the restart policy
    /// applies; when it is exhausted the backend ends STOPPED and the error is returned.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let recovery = self
            .inner
            .failures_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(failures) = recovery {
            tokio::spawn(self.clone().run_recovery(failures));
        }

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.handle.is_some() {
            return Ok(());
        }
        self.ensure_not_stopped()?;
        self.set_state(BackendState::Starting);
        match self.launch_locked(&mut lifecycle).await {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("analysis backend failed to start: {err}");
                self.record_failure(err.to_string());
                self.set_state(BackendState::Degraded);
                self.restart_loop_locked(&mut lifecycle, err).await
            }
        }
    }

    /// Tears down the current backend (if any) and starts a new one.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.ensure_not_stopped()?;
        self.set_state(BackendState::Degraded);
        self.teardown_locked(&mut lifecycle, "restart requested", true)
            .await;
        self.restart_loop_locked(&mut lifecycle, BridgeError::unavailable("restart requested"))
            .await
    }

    fn ensure_not_stopped(&self) -> Result<(), BridgeError> {
        if self.inner.shutdown.is_cancelled() || self.state() == BackendState::Stopped {
            return Err(BridgeError::unavailable("analysis backend is STOPPED"));
        }
        Ok(())
    }

    /// Recomputes the plugin set and restarts the backend on it. `serve` runs this on SIGHUP.
    pub async fn reprovision(&self) -> Result<Arc<PluginSet>, BridgeError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.ensure_not_stopped()?;
        let plugins_dir = self.plugins().plugins_dir.clone();

        // Release our own shared lock so a needed re-extraction is not blocked by us.
        self.set_state(BackendState::Degraded);
        self.teardown_locked(&mut lifecycle, "reprovisioning plugins", true)
            .await;

        let resolved = resolve_plugins_async(plugins_dir)
            .await
            .map(Arc::new)
            .map_err(provision_failure);
        let result = match resolved {
            Ok(plugins) => {
                *self
                    .inner
                    .plugins
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = plugins.clone();
                Ok(plugins)
            }
            Err(err) => Err(err),
        };
        // Come back up on whichever plugin set is current.
        self.restart_loop_locked(
            &mut lifecycle,
            BridgeError::unavailable("reprovisioning plugins"),
        )
        .await?;
        result
    }

    /// Graceful stop: `shutdown` request, then SIGTERM, then SIGKILL. Terminal.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.teardown_locked(&mut lifecycle, "bridge shutting down", true)
            .await;
        self.set_state(BackendState::Stopped);
    }

    pub fn status(&self) -> SupervisorStatus {
        let active = self.active();
        let stats = self.stats();
        SupervisorStatus {
            state: self.state(),
            engine: active.as_ref().map(|a| EngineInfo {
                engine_version: a.engine.engine_version.clone(),
                protocol_version: a.engine.protocol_version,
                languages: a.engine.languages.clone(),
                generation: a.generation,
                pid: a.pid,
            }),
            uptime_ms: active
                .as_ref()
                .map(|a| u64::try_from(a.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)),
            restarts: stats.restarts,
            bridge_restarts: stats.bridge_restarts,
            failures: stats.failures,
            last_failure: stats.last_failure.clone(),
            max_restarts: self.inner.config.max_restarts,
            transitions: stats.transitions.iter().cloned().collect(),
        }
    }

    fn record_failure(&self, reason: String) {
        let mut stats = self.stats();
        stats.failures = stats.failures.saturating_add(1);
        stats.last_failure = Some(reason);
    }

    async fn launch_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), BridgeError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let plugins = self.plugins();
        let guard = BridgeDirGuard::acquire_shared(&plugins).map_err(provision_failure)?;

        let launched = self
            .inner
            .launcher
            .launch(&plugins)
            .await
            .map_err(|err| BridgeError::ProcessCrash {
                reason: format!("{err:#}"),
            })?;
        let mut process = launched.process;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = RpcClient::spawn(launched.reader, launched.writer, events_tx);

        let params = InitializeParams {
            protocol_version: BACKEND_PROTOCOL_VERSION,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            plugin_paths: plugins.plugin_paths(),
            bridge_dir: plugins.bridge_dir.clone(),
            languages: plugins.languages.clone(),
        };
        let handshake = match client
            .initialize(&params, self.inner.config.handshake_timeout)
            .await
        {
            Ok(engine) if engine.protocol_version == BACKEND_PROTOCOL_VERSION => Ok(engine),
            Ok(engine) => Err(BridgeError::Protocol(format!(
                "engine speaks protocol v{}, bridge requires v{BACKEND_PROTOCOL_VERSION}",
                engine.protocol_version
            ))),
            Err(err) => Err(err),
        };
        let engine = match handshake {
            Ok(engine) => engine,
            Err(err) => {
                client.close("handshake failed");
                if let Some(process) = process.as_mut() {
                    process.terminate(self.inner.config.shutdown_grace).await;
                }
                return Err(err);
            }
        };

        let pid = process.as_ref().map(BackendProcess::pid);
        let started_at = Instant::now();
        log::info!(
            "analysis backend ready: engine {} (generation {generation}, {} language(s))",
            engine.engine_version,
            engine.languages.len()
        );
        self.set_active(Some(ActiveBackend {
            generation,
            client: client.clone(),
            engine: engine.clone(),
            pid,
            started_at,
        }));
        lifecycle.handle = Some(BackendHandle {
            generation,
            client: client.clone(),
            process,
            engine,
            started_at,
            _bridge_guard: guard,
        });
        tokio::spawn(self.clone().monitor(generation, client, events_rx));
        self.set_state(BackendState::Ready);
        Ok(())
    }

    async fn teardown_locked(&self, lifecycle: &mut Lifecycle, reason: &str, graceful: bool) {
        self.set_active(None);
        let Some(mut handle) = lifecycle.handle.take() else {
            return;
        };
        log::debug!(
            "tearing down backend generation {} (engine {}, up {}ms): {reason}",
            handle.generation,
            handle.engine.engine_version,
            handle.started_at.elapsed().as_millis()
        );
        if graceful && !handle.client.is_closed() {
            if let Err(err) = handle.client.shutdown(self.inner.config.shutdown_grace).await {
                log::debug!("backend shutdown request failed: {err}");
            }
        }
        handle.client.close(reason);
        if let Some(process) = handle.process.as_mut() {
            process.terminate(self.inner.config.shutdown_grace).await;
        }
    }

    async fn restart_loop_locked(
        &self,
        lifecycle: &mut Lifecycle,
        mut last_error: BridgeError,
    ) -> Result<(), BridgeError> {
        let max = self.inner.config.max_restarts;
        for attempt in 1..=max {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            self.set_state(BackendState::Restarting);
            let delay = self.inner.config.backoff_delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.cancelled() => break,
            }
            {
                let mut stats = self.stats();
                stats.restarts = stats.restarts.saturating_add(1);
            }
            log::info!("restarting analysis backend (attempt {attempt}/{max})");
            match self.launch_locked(lifecycle).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("restart attempt {attempt}/{max} failed: {err}");
                    self.record_failure(err.to_string());
                    last_error = err;
                    self.set_state(BackendState::Degraded);
                }
            }
        }
        if self.inner.shutdown.is_cancelled() {
            self.set_state(BackendState::Stopped);
            return Err(BridgeError::unavailable("analysis backend is STOPPED"));
        }
        log::error!("analysis backend could not be restarted after {max} attempt(s); giving up");
        self.set_state(BackendState::Stopped);
        Err(BridgeError::unavailable(format!(
            "analysis backend stopped after exhausting restarts: {last_error}"
        )))
    }

    async fn handle_failure(&self, generation: u64, cause: FailureCause) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let current = lifecycle.handle.as_ref().map(|h| h.generation);
        if current != Some(generation) || self.inner.shutdown.is_cancelled() {
            log::debug!("ignoring failure of stale backend generation {generation}: {cause}");
            return;
        }
        log::warn!("analysis backend failed: {cause}");
        self.record_failure(cause.to_string());
        self.set_state(BackendState::Degraded);
        let graceful = !matches!(cause, FailureCause::ChannelClosed(_));
        let reason = cause.to_string();
        self.teardown_locked(&mut lifecycle, &reason, graceful).await;
        let _ = self
            .restart_loop_locked(&mut lifecycle, BridgeError::unavailable(reason))
            .await;
    }

    async fn run_recovery(self, mut failures: mpsc::UnboundedReceiver<FailureReport>) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                report = failures.recv() => match report {
                    Some((generation, cause)) => self.handle_failure(generation, cause).await,
                    None => return,
                },
            }
        }
    }

    async fn monitor(
        self,
        generation: u64,
        client: RpcClient,
        mut events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        let config = self.inner.config.clone();
        let mut ticker = tokio::time::interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses = 0u32;
        let mut bridge_restart_attempted = false;

        let cause = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(BackendEvent::Closed { reason }) => break FailureCause::ChannelClosed(reason),
                    None => break FailureCause::ChannelClosed("event stream ended".to_string()),
                    Some(BackendEvent::BridgeStatus { health, detail }) => {
                        if let Some(detail) = detail {
                            log::info!("JS/TS bridge reported {health:?}: {detail}");
                        }
                        if let Some(cause) = self
                            .on_bridge_health(&client, health, &mut bridge_restart_attempted)
                            .await
                        {
                            break cause;
                        }
                    }
                },
                _ = ticker.tick() => match client.ping(config.heartbeat_timeout).await {
                    Ok(ping) => {
                        misses = 0;
                        if let Some(cause) = self
                            .on_bridge_health(&client, ping.bridge, &mut bridge_restart_attempted)
                            .await
                        {
                            break cause;
                        }
                    }
                    Err(BridgeError::Timeout { .. }) => {
                        misses += 1;
                        log::warn!(
                            "heartbeat missed ({misses}/{}) for backend generation {generation}",
                            config.heartbeat_misses
                        );
                        if misses >= config.heartbeat_misses {
                            break FailureCause::MissedHeartbeats(misses);
                        }
                    }
                    Err(err) => break FailureCause::ChannelClosed(err.to_string()),
                },
            }
        };
        let _ = self.inner.failures_tx.send((generation, cause));
    }

    /// One bridge-only restart per outage; a second report (or a failed restart) escalates.
    async fn on_bridge_health(
        &self,
        client: &RpcClient,
        health: BridgeHealth,
        restart_attempted: &mut bool,
    ) -> Option<FailureCause> {
        match health {
            BridgeHealth::Up | BridgeHealth::NotStarted => {
                *restart_attempted = false;
                None
            }
            BridgeHealth::Unreachable if *restart_attempted => {
                Some(FailureCause::BridgeUnreachable)
            }
            BridgeHealth::Unreachable => {
                *restart_attempted = true;
                {
                    let mut stats = self.stats();
                    stats.bridge_restarts = stats.bridge_restarts.saturating_add(1);
                }
                log::warn!("JS/TS bridge unreachable; restarting the bridge");
                match client.restart_bridge(self.inner.config.request_timeout).await {
                    Ok(BridgeHealth::Up) => {
                        log::info!("JS/TS bridge restarted");
                        *restart_attempted = false;
                        None
                    }
                    Ok(other) => {
                        log::warn!("JS/TS bridge still {other:?} after restart");
                        Some(FailureCause::BridgeUnreachable)
                    }
                    Err(err) => {
                        log::warn!("JS/TS bridge restart failed: {err}");
                        Some(FailureCause::BridgeUnreachable)
                    }
                }
            }
        }
    }
}

fn provision_failure(err: ProvisionError) -> BridgeError {
    BridgeError::unavailable(format!("plugin provisioning: {err}"))
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
