//! Admission, bounded concurrency and de-duplication of tool calls against the shared backend.

use crate::backend::{BackendState, Supervisor};
use crate::error::{BridgeError, Result, DEFAULT_RETRY_AFTER_MS};
use crate::rpc::{deadline_elapsed, AnalysisRequest, RpcClient};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sonar_mcp_protocol::backend::{AnalysisTarget, ListRulesParams};
use sonar_mcp_protocol::{AnalysisResult, QualityProfile, RuleDescriptor};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_in_flight: usize,
    /// Analyses allowed to wait for a permit; beyond this new ones are rejected.
    pub max_queued: usize,
    /// How long a call may wait for the backend to become READY.
    pub admission_wait: Duration,
    pub default_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_queued: 32,
            admission_wait: Duration::from_secs(5),
            default_timeout: Duration::from_secs(60),
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(600),
        }
    }
}

impl SessionConfig {
    pub fn clamp_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let requested = requested_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        requested.clamp(self.min_timeout, self.max_timeout.max(self.min_timeout))
    }
}

/// One MCP tool call as seen by the session layer.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub request_id: String,
    pub timeout: Duration,
    pub deadline: Instant,
    /// Fires when the client sends `notifications/cancelled` for this request.
    pub cancel: CancellationToken,
}

impl ToolInvocation {
    pub fn new(
        tool_name: impl Into<String>,
        request_id: impl Into<String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            request_id: request_id.into(),
            timeout,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Identity of an analysis for de-duplication: same target, language and profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    target: String,
    language: Option<String>,
    profile: Option<String>,
}

impl AnalysisKey {
    pub fn for_request(request: &AnalysisRequest) -> Self {
        let target = match &request.target {
            AnalysisTarget::File { path } => format!("file:{}", path.display()),
            AnalysisTarget::Content { content, file_name } => {
                let mut hasher = Sha256::new();
                hasher.update(file_name.as_bytes());
                hasher.update([0u8]);
                hasher.update(content.as_bytes());
                format!("sha256:{:x}", hasher.finalize())
            }
        };
        Self {
            target,
            language: request.language.clone(),
            profile: request.profile.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: Arc<AnalysisResult>,
    /// The caller attached to an analysis another caller had already started.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub max_in_flight: usize,
    pub max_queued: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub shared_analyses: usize,
    pub submitted: u64,
    pub deduplicated: u64,
    pub expired_in_queue: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

type SharedOutcome = std::result::Result<Arc<AnalysisResult>, BridgeError>;

struct SharedAnalysis {
    /// Guarded by the `analyses` map lock.
    waiters: AtomicUsize,
    cancel: CancellationToken,
    /// Latest deadline of any attached caller; the analysis runs until it passes.
    deadline: watch::Sender<Instant>,
    outcome: watch::Receiver<Option<SharedOutcome>>,
}

impl SharedAnalysis {
    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    fn extend_deadline(&self, deadline: Instant) {
        self.deadline.send_if_modified(|current| {
            if deadline > *current {
                *current = deadline;
                true
            } else {
                false
            }
        });
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    expired_in_queue: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    supervisor: Supervisor,
    config: SessionConfig,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    analyses: Mutex<HashMap<AnalysisKey, Arc<SharedAnalysis>>>,
    counters: Counters,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(supervisor: Supervisor, config: SessionConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            inner: Arc::new(Inner {
                supervisor,
                config: SessionConfig {
                    max_in_flight,
                    ..config
                },
                permits: Arc::new(Semaphore::new(max_in_flight)),
                queued: AtomicUsize::new(0),
                analyses: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    fn analyses(&self) -> MutexGuard<'_, HashMap<AnalysisKey, Arc<SharedAnalysis>>> {
        self.inner
            .analyses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one analysis, or attaches to an identical one already in flight.
    pub async fn analyze(
        &self,
        invocation: &ToolInvocation,
        request: AnalysisRequest,
    ) -> Result<AnalysisOutcome> {
        let key = AnalysisKey::for_request(&request);
        let (shared, deduplicated) = {
            let mut analyses = self.analyses();
            match analyses.get(&key) {
                Some(existing) if !existing.cancel.is_cancelled() => {
                    existing.waiters.fetch_add(1, Ordering::SeqCst);
                    existing.extend_deadline(invocation.deadline);
                    Counters::bump(&self.inner.counters.deduplicated);
                    (existing.clone(), true)
                }
                _ => {
                    let (tx, rx) = watch::channel(None);
                    let shared = Arc::new(SharedAnalysis {
                        waiters: AtomicUsize::new(1),
                        cancel: CancellationToken::new(),
                        deadline: watch::channel(invocation.deadline).0,
                        outcome: rx,
                    });
                    analyses.insert(key.clone(), shared.clone());
                    tokio::spawn(self.clone().run_shared(key.clone(), shared.clone(), tx, request));
                    (shared, false)
                }
            }
        };
        if deduplicated {
            log::debug!(
                "{} {}: attached to in-flight analysis",
                invocation.tool_name,
                invocation.request_id
            );
        }

        let _waiter = WaiterGuard {
            session: self,
            key: &key,
            shared: &shared,
        };
        let mut outcome = shared.outcome.clone();
        let settled = tokio::select! {
            _ = invocation.cancel.cancelled() => {
                Counters::bump(&self.inner.counters.cancelled);
                Err(BridgeError::Cancelled)
            }
            _ = tokio::time::sleep_until(invocation.deadline) => {
                Err(BridgeError::timeout("analysis", invocation.timeout))
            }
            ready = outcome.wait_for(Option::is_some) => match ready {
                Ok(value) => (*value)
                    .clone()
                    .unwrap_or_else(|| Err(BridgeError::unavailable("analysis ended without a result"))),
                Err(_) => Err(BridgeError::unavailable("analysis task ended without a result")),
            },
        };
        settled.map(|result| AnalysisOutcome {
            result,
            deduplicated,
        })
    }

    async fn run_shared(
        self,
        key: AnalysisKey,
        shared: Arc<SharedAnalysis>,
        tx: watch::Sender<Option<SharedOutcome>>,
        request: AnalysisRequest,
    ) {
        let deadline = shared.deadline.subscribe();
        let outcome = tokio::select! {
            _ = shared.cancel.cancelled() => Err(BridgeError::Cancelled),
            outcome = self.execute(request, deadline, Instant::now()) => outcome,
        };
        let mut analyses = self.analyses();
        let _ = tx.send(Some(outcome));
        if analyses
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &shared))
        {
            analyses.remove(&key);
        }
    }

    async fn execute(
        &self,
        request: AnalysisRequest,
        deadline: watch::Receiver<Instant>,
        started: Instant,
    ) -> SharedOutcome {
        let admit_by = *deadline.borrow();
        self.admit(admit_by).await?;
        let _permit = self.acquire_permit(&deadline, started).await?;
        let client = self.inner.supervisor.client()?;
        Counters::bump(&self.inner.counters.submitted);
        let stream = client.submit_until(request, deadline).await?;
        log::debug!("analysis {} submitted", stream.correlation_id());
        stream.collect().await.map(Arc::new)
    }

    /// Waits (bounded) for READY. Fails fast when the backend is STOPPED.
    async fn admit(&self, deadline: Instant) -> Result<()> {
        let supervisor = &self.inner.supervisor;
        match supervisor.state() {
            BackendState::Ready => Ok(()),
            BackendState::Stopped => Err(BridgeError::unavailable("analysis backend is STOPPED")),
            _ => {
                let wait = self
                    .inner
                    .config
                    .admission_wait
                    .min(deadline.saturating_duration_since(Instant::now()));
                supervisor.wait_ready(wait).await
            }
        }
    }

    async fn acquire_permit(
        &self,
        deadline: &watch::Receiver<Instant>,
        started: Instant,
    ) -> Result<OwnedSemaphorePermit> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => {
                return Err(BridgeError::unavailable("session is shutting down"))
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let max_queued = self.inner.config.max_queued;
        if self.inner.queued.fetch_add(1, Ordering::SeqCst) >= max_queued {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            Counters::bump(&self.inner.counters.rejected);
            return Err(BridgeError::BackendUnavailable {
                reason: format!("analysis queue is full ({max_queued} waiting)"),
                retry_after_ms: DEFAULT_RETRY_AFTER_MS,
            });
        }
        let _slot = QueueSlot(&self.inner.queued);

        tokio::select! {
            biased;
            acquired = self.inner.permits.clone().acquire_owned() => {
                acquired.map_err(|_| BridgeError::unavailable("session is shutting down"))
            }
            _ = deadline_elapsed(deadline.clone()) => {
                Counters::bump(&self.inner.counters.expired_in_queue);
                let budget = deadline.borrow().saturating_duration_since(started);
                Err(BridgeError::timeout("queued analysis", budget))
            }
        }
    }

    pub async fn list_rules(
        &self,
        invocation: &ToolInvocation,
        params: ListRulesParams,
    ) -> Result<Vec<RuleDescriptor>> {
        self.with_client(invocation, "rules/list", |client, timeout| async move {
            client.list_rules(&params, timeout).await
        })
        .await
    }

    pub async fn fetch_profile(
        &self,
        invocation: &ToolInvocation,
        key: String,
    ) -> Result<QualityProfile> {
        self.with_client(invocation, "profiles/get", |client, timeout| async move {
            client.fetch_profile(&key, timeout).await
        })
        .await
    }

    /// Plain backend call under the invocation's deadline and cancellation.
    async fn with_client<T, F, Fut>(
        &self,
        invocation: &ToolInvocation,
        operation: &str,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce(RpcClient, Duration) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let work = async {
            self.admit(invocation.deadline).await?;
            let client = self.inner.supervisor.client()?;
            let remaining = invocation.remaining();
            if remaining.is_zero() {
                return Err(BridgeError::timeout(operation, invocation.timeout));
            }
            call(client, remaining).await
        };
        tokio::select! {
            _ = invocation.cancel.cancelled() => {
                Counters::bump(&self.inner.counters.cancelled);
                Err(BridgeError::Cancelled)
            }
            result = work => result,
        }
    }

    pub fn status(&self) -> SessionStatus {
        let config = &self.inner.config;
        let counters = &self.inner.counters;
        SessionStatus {
            max_in_flight: config.max_in_flight,
            max_queued: config.max_queued,
            in_flight: config
                .max_in_flight
                .saturating_sub(self.inner.permits.available_permits()),
            queued: self.inner.queued.load(Ordering::SeqCst),
            shared_analyses: self.analyses().len(),
            submitted: counters.submitted.load(Ordering::Relaxed),
            deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            expired_in_queue: counters.expired_in_queue.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Detaches a caller from a shared analysis; the last one out cancels it.
struct WaiterGuard<'a> {
    session: &'a SessionManager,
    key: &'a AnalysisKey,
    shared: &'a Arc<SharedAnalysis>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut analyses = self.session.analyses();
        if self.shared.waiters.fetch_sub(1, Ordering::SeqCst) != 1 || self.shared.is_settled() {
            return;
        }
        self.shared.cancel.cancel();
        if analyses
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, self.shared))
        {
            analyses.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SupervisorConfig;
    use crate::engine_stub::{StubBehavior, StubCounters};
    use crate::test_support::{fast_supervisor_config, stub_plugin_set, StubLauncher};
    use sonar_mcp_protocol::backend::error_codes;
    use sonar_mcp_protocol::AnalysisStatus;

    const SNIPPET: &str = "// TODO: drop\nconst password = \"hunter2\";\n";

    async fn session(
        launcher: Arc<StubLauncher>,
        config: SessionConfig,
    ) -> (SessionManager, tempfile::TempDir) {
        session_with(launcher, config, fast_supervisor_config()).await
    }

    async fn session_with(
        launcher: Arc<StubLauncher>,
        config: SessionConfig,
        supervisor_config: SupervisorConfig,
    ) -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(supervisor_config, launcher, stub_plugin_set(dir.path()));
        supervisor.start().await.unwrap();
        (SessionManager::new(supervisor, config), dir)
    }

    fn snippet(content: &str, file_name: &str) -> AnalysisRequest {
        AnalysisRequest {
            target: AnalysisTarget::Content {
                content: content.to_string(),
                file_name: file_name.to_string(),
            },
            language: Some("js".to_string()),
            profile: None,
        }
    }

    fn invocation(timeout: Duration) -> ToolInvocation {
        ToolInvocation::new("analyze_code_snippet", "1", timeout, CancellationToken::new())
    }

    fn submits(counters: &StubCounters) -> usize {
        counters.submits.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn analysis_returns_normalized_issues() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior::default()));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let outcome = session
            .analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
            .await
            .unwrap();
        assert_eq!(outcome.result.status, AnalysisStatus::Complete);
        let keys: Vec<&str> = outcome
            .result
            .issues
            .iter()
            .map(|i| i.rule_key.as_str())
            .collect();
        assert_eq!(keys, vec!["javascript:S1135", "javascript:S2068"]);
        assert!(!outcome.deduplicated);
        assert_eq!(submits(&launcher.counters), 1);
    }

    #[tokio::test]
    async fn identical_concurrent_requests_share_one_analysis() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior {
            analysis_delay: Duration::from_millis(200),
            ..StubBehavior::default()
        }));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let first_call = invocation(Duration::from_secs(5));
        let second_call = invocation(Duration::from_secs(5));
        let (a, b) = tokio::join!(
            session.analyze(&first_call, snippet(SNIPPET, "a.js")),
            session.analyze(&second_call, snippet(SNIPPET, "a.js")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a.result, &b.result));
        assert!(a.deduplicated != b.deduplicated);
        assert_eq!(submits(&launcher.counters), 1);
        assert_eq!(session.status().deduplicated, 1);
        assert_eq!(session.status().shared_analyses, 0);
    }

    #[tokio::test]
    async fn shared_analysis_runs_until_the_latest_caller_deadline() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior {
            analysis_delay: Duration::from_millis(600),
            ..StubBehavior::default()
        }));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let impatient = invocation(Duration::from_millis(300));
        let patient = invocation(Duration::from_secs(10));
        let (short, long) = tokio::join!(
            session.analyze(&impatient, snippet(SNIPPET, "a.js")),
            session.analyze(&patient, snippet(SNIPPET, "a.js")),
        );
        let err = short.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
        let outcome = long.unwrap();
        assert!(outcome.deduplicated);
        assert_eq!(outcome.result.status, AnalysisStatus::Complete);
        assert_eq!(outcome.result.issues.len(), 2);
        assert_eq!(submits(&launcher.counters), 1);
        assert_eq!(launcher.counters.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sequential_identical_requests_give_identical_results() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior::default()));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let first = session
            .analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
            .await
            .unwrap();
        let second = session
            .analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
            .await
            .unwrap();
        assert_eq!(*first.result, *second.result);
        assert!(!second.deduplicated);
        assert_eq!(submits(&launcher.counters), 2);
    }

    #[tokio::test]
    async fn request_expiring_in_queue_is_never_submitted() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior {
            analysis_delay: Duration::from_millis(400),
            ..StubBehavior::default()
        }));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let busy = session.clone();
        let first = tokio::spawn(async move {
            busy.analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = session
            .analyze(&invocation(Duration::from_millis(100)), snippet("x", "b.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");

        first.await.unwrap().unwrap();
        assert_eq!(submits(&launcher.counters), 1);
        assert_eq!(session.status().queued, 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_as_retryable() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior {
            analysis_delay: Duration::from_millis(300),
            ..StubBehavior::default()
        }));
        let config = SessionConfig {
            max_queued: 0,
            ..SessionConfig::default()
        };
        let (session, _dir) = session(launcher.clone(), config).await;

        let busy = session.clone();
        let first = tokio::spawn(async move {
            busy.analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = session
            .analyze(&invocation(Duration::from_secs(5)), snippet("x", "b.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }), "{err:?}");
        assert!(err.is_retryable());
        first.await.unwrap().unwrap();
        assert_eq!(session.status().rejected, 1);
    }

    #[tokio::test]
    async fn client_cancellation_reaches_the_backend() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior {
            analysis_delay: Duration::from_millis(500),
            ..StubBehavior::default()
        }));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let call = invocation(Duration::from_secs(5));
        let token = call.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let err = session
            .analyze(&call, snippet(SNIPPET, "a.js"))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Cancelled);

        let deadline = Instant::now() + Duration::from_secs(2);
        while launcher.counters.cancels.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(launcher.counters.cancels.load(Ordering::SeqCst), 1);

        // The permit is released; the next call goes straight through.
        session
            .analyze(&invocation(Duration::from_secs(5)), snippet("y", "c.js"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn crash_mid_analysis_is_retryable_and_recovers() {
        let launcher = Arc::new(StubLauncher::with_sequence(vec![
            StubBehavior {
                crash_on_submit: true,
                ..StubBehavior::default()
            },
            StubBehavior::default(),
        ]));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;

        let err = session
            .analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");

        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.launches.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        session
            .supervisor()
            .wait_ready(Duration::from_secs(5))
            .await
            .unwrap();
        let outcome = session
            .analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
            .await
            .unwrap();
        assert_eq!(outcome.result.issues.len(), 2);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stopped_backend_is_rejected_without_waiting() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior::default()));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;
        session.supervisor().stop().await;

        let started = Instant::now();
        let err = session
            .analyze(&invocation(Duration::from_secs(5)), snippet(SNIPPET, "a.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(submits(&launcher.counters), 0);
    }

    #[tokio::test]
    async fn restart_backoff_fails_fast_without_admission_wait() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior::default()));
        let config = SessionConfig {
            admission_wait: Duration::ZERO,
            ..SessionConfig::default()
        };
        let supervisor_config = SupervisorConfig {
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(5),
            ..fast_supervisor_config()
        };
        let (session, _dir) = session_with(launcher.clone(), config, supervisor_config).await;

        launcher.crash_current();
        let mut states = session.supervisor().subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|state| *state == BackendState::Restarting),
        )
        .await
        .unwrap()
        .unwrap();

        let started = Instant::now();
        let err = session
            .list_rules(
                &invocation(Duration::from_secs(5)),
                ListRulesParams {
                    language: Some("js".to_string()),
                    profile: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }), "{err:?}");
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_errors_pass_through_verbatim() {
        let launcher = Arc::new(StubLauncher::new(StubBehavior::default()));
        let (session, _dir) = session(launcher.clone(), SessionConfig::default()).await;
        let call = invocation(Duration::from_secs(5));

        let rules = session
            .list_rules(
                &call,
                ListRulesParams {
                    language: Some("js".to_string()),
                    profile: None,
                },
            )
            .await
            .unwrap();
        assert!(rules.iter().any(|r| r.key == "javascript:S1135"));

        let err = session
            .fetch_profile(&call, "missing".to_string())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::BackendFailure {
                code: error_codes::UNKNOWN_PROFILE,
                message: "Profile 'missing' not found".to_string(),
            }
        );
    }

    #[test]
    fn timeouts_are_clamped() {
        let config = SessionConfig::default();
        assert_eq!(config.clamp_timeout(None), config.default_timeout);
        assert_eq!(config.clamp_timeout(Some(1)), Duration::from_millis(100));
        assert_eq!(config.clamp_timeout(Some(u64::MAX)), Duration::from_secs(600));
    }

    #[test]
    fn snippet_keys_depend_on_content_and_name() {
        let a = AnalysisKey::for_request(&snippet("x", "a.js"));
        assert_eq!(a, AnalysisKey::for_request(&snippet("x", "a.js")));
        assert_ne!(a, AnalysisKey::for_request(&snippet("y", "a.js")));
        assert_ne!(a, AnalysisKey::for_request(&snippet("x", "b.js")));
    }
}
