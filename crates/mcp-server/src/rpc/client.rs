//! Request/response correlation over one backend channel.
//!
//! Ids are monotonic per connection and never reused. Every id owns at most one pending slot;
//! a reply for an id that is unknown or already settled is logged and dropped, never delivered
//! to a different caller. When the channel closes, all pending work fails with
//! [`BridgeError::BackendUnavailable`].

use super::codec::{FrameReader, FrameWriter};
use super::pending::{Completion, SlotMap, StreamMap};
use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sonar_mcp_protocol::backend::{
    error_codes, methods, notifications, AnalysisTarget, BridgeHealth, BridgeRestartResult,
    BridgeStatusParams, CancelParams, CancelRequestParams, CompletedParams, CompletionStatus,
    GetProfileParams, GetProfileResult, InitializeParams, InitializeResult, IssuesParams,
    ListRulesParams, ListRulesResult, LogParams, PingResult, RpcErrorObject, RpcFrame,
    RpcNotification, RpcResponse, SubmitAck, SubmitParams,
};
use sonar_mcp_protocol::{AnalysisResult, AnalysisStatus, Issue, QualityProfile, RuleDescriptor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Out-of-band signals from the backend channel, consumed by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    BridgeStatus {
        health: BridgeHealth,
        detail: Option<String>,
    },
    Closed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub target: AnalysisTarget,
    pub language: Option<String>,
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisFragment {
    Issues(Vec<Issue>),
    Completed(AnalysisStatus),
    Failed(BridgeError),
}

type CallReply = std::result::Result<Value, BridgeError>;

/// Upper bound for writing a notification nobody waits a reply for.
const NOTIFY_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves once the latest deadline published on `deadline` has passed.
pub(crate) async fn deadline_elapsed(mut deadline: watch::Receiver<Instant>) {
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep_until(current) => {
                if *deadline.borrow() <= current {
                    return;
                }
            }
            changed = deadline.changed() => {
                if changed.is_err() {
                    // Nobody can extend it any more.
                    let last = *deadline.borrow();
                    tokio::time::sleep_until(last).await;
                    return;
                }
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    calls: SlotMap<CallReply>,
    streams: StreamMap<AnalysisFragment>,
    closed: Option<String>,
}

struct Inner {
    writer: FrameWriter,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, frame: RpcFrame, events: &mpsc::UnboundedSender<BackendEvent>) {
        match frame {
            RpcFrame::Response(response) => self.on_response(response),
            RpcFrame::Notification(note) => self.on_notification(note, events),
            RpcFrame::Request(request) => {
                log::debug!("backend sent unsupported request {}", request.method);
                let reply = RpcFrame::Response(RpcResponse::err(
                    request.id,
                    RpcErrorObject::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("bridge does not serve {}", request.method),
                    ),
                ));
                let _ = self.writer.send(&reply).await;
            }
        }
    }

    fn on_response(&self, response: RpcResponse) {
        let id = response.id;
        let reply = match (response.error, response.result) {
            (Some(error), _) => Err(BridgeError::from(error)),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        };
        let completion = self.lock().calls.complete(id, reply);
        log_completion("response", id, completion);
    }

    fn on_notification(&self, note: RpcNotification, events: &mpsc::UnboundedSender<BackendEvent>) {
        match note.method.as_str() {
            notifications::ISSUES => match serde_json::from_value::<IssuesParams>(note.params) {
                Ok(params) => {
                    let completion = self.lock().streams.push(
                        params.correlation_id,
                        AnalysisFragment::Issues(params.issues),
                    );
                    log_completion("issues", params.correlation_id, completion);
                }
                Err(err) => log::warn!("discarding malformed {}: {err}", notifications::ISSUES),
            },
            notifications::COMPLETED => {
                match serde_json::from_value::<CompletedParams>(note.params) {
                    Ok(params) => {
                        let fragment = match params.status {
                            CompletionStatus::Complete => {
                                AnalysisFragment::Completed(AnalysisStatus::Complete)
                            }
                            CompletionStatus::Partial => {
                                AnalysisFragment::Completed(AnalysisStatus::Partial)
                            }
                            CompletionStatus::Failed => {
                                AnalysisFragment::Failed(params.error.map_or_else(
                                    || BridgeError::BackendFailure {
                                        code: error_codes::ANALYSIS_FAILED,
                                        message: "analysis failed".to_string(),
                                    },
                                    BridgeError::from,
                                ))
                            }
                        };
                        let completion =
                            self.lock().streams.finish(params.correlation_id, fragment);
                        log_completion("completion", params.correlation_id, completion);
                    }
                    Err(err) => {
                        log::warn!("discarding malformed {}: {err}", notifications::COMPLETED)
                    }
                }
            }
            notifications::BRIDGE_STATUS => {
                match serde_json::from_value::<BridgeStatusParams>(note.params) {
                    Ok(params) => {
                        let _ = events.send(BackendEvent::BridgeStatus {
                            health: params.bridge,
                            detail: params.detail,
                        });
                    }
                    Err(err) => {
                        log::warn!("discarding malformed {}: {err}", notifications::BRIDGE_STATUS)
                    }
                }
            }
            notifications::LOG => {
                if let Ok(params) = serde_json::from_value::<LogParams>(note.params) {
                    let level = match params.level.to_ascii_lowercase().as_str() {
                        "error" => log::Level::Error,
                        "warn" | "warning" => log::Level::Warn,
                        "debug" => log::Level::Debug,
                        "trace" => log::Level::Trace,
                        _ => log::Level::Info,
                    };
                    log::log!(target: "sonar_mcp::engine", level, "{}", params.message);
                }
            }
            other => log::debug!("ignoring backend notification {other}"),
        }
    }

    fn close(&self, reason: &str) {
        let (calls, streams) = {
            let mut pending = self.lock();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(reason.to_string());
            (pending.calls.drain(), pending.streams.drain())
        };
        if !calls.is_empty() || !streams.is_empty() {
            log::warn!(
                "backend channel closed ({reason}); failing {} pending request(s)",
                calls.len() + streams.len()
            );
        }
        let err = BridgeError::unavailable(reason);
        for tx in calls {
            let _ = tx.send(Err(err.clone()));
        }
        for tx in streams {
            let _ = tx.send(AnalysisFragment::Failed(err.clone()));
        }
    }
}

fn log_completion(kind: &str, id: u64, completion: Completion) {
    match completion {
        Completion::Delivered => {}
        Completion::Unknown => log::warn!("discarding {kind} for unknown id {id}"),
        Completion::Cancelled => log::debug!("discarding late {kind} for cancelled id {id}"),
        Completion::AlreadyFulfilled => {
            log::warn!("discarding duplicate {kind} for already completed id {id}")
        }
    }
}

async fn run_read_loop<R>(
    mut reader: FrameReader<R>,
    inner: Weak<Inner>,
    events: mpsc::UnboundedSender<BackendEvent>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "backend closed its output".to_string(),
            Err(err) => break format!("read from backend failed: {err}"),
        };
        let Some(strong) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(frame) => strong.dispatch(frame, &events).await,
            Err(err) => log::warn!("discarding backend frame: {err}"),
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.close(&reason);
    }
    let _ = events.send(BackendEvent::Closed { reason });
}

/// Clears a call slot if the caller stops waiting before the reply arrives.
struct CallGuard<'a> {
    inner: &'a Inner,
    id: u64,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().calls.cancel(self.id);
        }
    }
}

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Starts the reader task; `events` receives bridge status changes and channel closure.
    pub fn spawn<R, W>(read: R, write: W, events: mpsc::UnboundedSender<BackendEvent>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inner = Arc::new(Inner {
            writer: FrameWriter::spawn(write),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Pending::default()),
        });
        tokio::spawn(run_read_loop(
            FrameReader::new(read),
            Arc::downgrade(&inner),
            events,
        ));
        Self { inner }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    /// Fails every pending request and refuses new ones.
    pub fn close(&self, reason: &str) {
        self.inner.close(reason);
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.inner.lock();
        pending.calls.len() + pending.streams.len()
    }

    pub async fn call<P, T>(&self, method: &str, params: &P, timeout: Duration) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|err| BridgeError::Protocol(format!("encode {method} params: {err}")))?;
        let id = self.next_id();
        let rx = {
            let mut pending = self.inner.lock();
            if let Some(reason) = pending.closed.as_ref() {
                return Err(BridgeError::unavailable(reason.clone()));
            }
            pending.calls.register(id)
        };
        let mut guard = CallGuard {
            inner: &*self.inner,
            id,
            armed: true,
        };

        let deadline = Instant::now() + timeout;
        self.send_until(&RpcFrame::request(id, method, params), deadline, method, timeout)
            .await?;

        let value = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => {
                guard.armed = false;
                reply?
            }
            Ok(Err(_)) => {
                guard.armed = false;
                return Err(BridgeError::unavailable("backend channel closed"));
            }
            Err(_) => {
                drop(guard);
                let _ = self
                    .notify(methods::CANCEL_REQUEST, &CancelRequestParams { id })
                    .await;
                return Err(BridgeError::timeout(method, timeout));
            }
        };

        serde_json::from_value(value)
            .map_err(|err| BridgeError::Protocol(format!("unexpected {method} result: {err}")))
    }

    pub async fn notify<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        if let Some(reason) = self.inner.lock().closed.clone() {
            return Err(BridgeError::unavailable(reason));
        }
        let params = serde_json::to_value(params)
            .map_err(|err| BridgeError::Protocol(format!("encode {method} params: {err}")))?;
        self.send_until(
            &RpcFrame::notification(method, params),
            Instant::now() + NOTIFY_WRITE_TIMEOUT,
            method,
            NOTIFY_WRITE_TIMEOUT,
        )
        .await
    }

    /// A backend that stops draining its input must not wedge callers. A write that misses
    /// its deadline may have left a partial frame behind, so the channel is closed.
    async fn send_until(
        &self,
        frame: &RpcFrame,
        deadline: Instant,
        operation: &str,
        budget: Duration,
    ) -> Result<()> {
        match tokio::time::timeout_at(deadline, self.inner.writer.send(frame)).await {
            Ok(sent) => sent,
            Err(_) => {
                self.close(&format!("write of {operation} to backend timed out"));
                Err(BridgeError::timeout(operation, budget))
            }
        }
    }

    pub async fn initialize(
        &self,
        params: &InitializeParams,
        timeout: Duration,
    ) -> Result<InitializeResult> {
        self.call(methods::INITIALIZE, params, timeout).await
    }

    pub async fn ping(&self, timeout: Duration) -> Result<PingResult> {
        self.call(methods::PING, &Value::Null, timeout).await
    }

    pub async fn list_rules(
        &self,
        params: &ListRulesParams,
        timeout: Duration,
    ) -> Result<Vec<RuleDescriptor>> {
        let result: ListRulesResult = self.call(methods::LIST_RULES, params, timeout).await?;
        Ok(result.rules)
    }

    pub async fn fetch_profile(&self, key: &str, timeout: Duration) -> Result<QualityProfile> {
        let params = GetProfileParams {
            key: key.to_string(),
        };
        let result: GetProfileResult = self.call(methods::GET_PROFILE, &params, timeout).await?;
        Ok(result.profile)
    }

    pub async fn restart_bridge(&self, timeout: Duration) -> Result<BridgeHealth> {
        let result: BridgeRestartResult = self
            .call(methods::BRIDGE_RESTART, &Value::Null, timeout)
            .await?;
        Ok(result.bridge)
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let _: Value = self.call(methods::SHUTDOWN, &Value::Null, timeout).await?;
        Ok(())
    }

    /// Submits an analysis and returns its result stream once the backend acknowledges it.
    pub async fn submit(&self, request: AnalysisRequest, deadline: Instant) -> Result<AnalysisStream> {
        self.submit_until(request, watch::channel(deadline).1).await
    }

    /// Like [`submit`](Self::submit), but the stream keeps running while the deadline is pushed
    /// back through `deadline`.
    pub async fn submit_until(
        &self,
        request: AnalysisRequest,
        deadline: watch::Receiver<Instant>,
    ) -> Result<AnalysisStream> {
        let correlation_id = self.next_id();
        let rx = {
            let mut pending = self.inner.lock();
            if let Some(reason) = pending.closed.as_ref() {
                return Err(BridgeError::unavailable(reason.clone()));
            }
            pending.streams.register(correlation_id)
        };
        let started = Instant::now();
        let remaining = deadline.borrow().saturating_duration_since(started);
        let mut stream = AnalysisStream {
            correlation_id,
            rx,
            client: self.clone(),
            deadline,
            started,
            finished: false,
        };

        if remaining.is_zero() {
            stream.discard();
            return Err(BridgeError::timeout("analysis", Duration::ZERO));
        }

        let params = SubmitParams {
            correlation_id,
            target: request.target,
            language: request.language,
            profile: request.profile,
        };
        match self
            .call::<_, SubmitAck>(methods::SUBMIT, &params, remaining)
            .await
        {
            Ok(ack) if ack.accepted => Ok(stream),
            Ok(_) => {
                stream.discard();
                Err(BridgeError::BackendFailure {
                    code: error_codes::ANALYSIS_FAILED,
                    message: "backend rejected the analysis request".to_string(),
                })
            }
            // Dropping the stream also tells the backend to abandon the correlation id.
            Err(err @ BridgeError::Timeout { .. }) => Err(err),
            Err(err) => {
                stream.discard();
                Err(err)
            }
        }
    }

    /// Best-effort: the slot is settled locally right away, the backend is told afterwards.
    pub async fn cancel_analysis(&self, correlation_id: u64) {
        self.inner.lock().streams.cancel(correlation_id);
        if let Err(err) = self
            .notify(methods::CANCEL, &CancelParams { correlation_id })
            .await
        {
            log::debug!("cancel for analysis {correlation_id} not delivered: {err}");
        }
    }
}

/// Partial issue batches of one submitted analysis, then exactly one terminal outcome.
///
/// Dropping an unfinished stream cancels the analysis on the backend.
pub struct AnalysisStream {
    correlation_id: u64,
    rx: mpsc::UnboundedReceiver<AnalysisFragment>,
    client: RpcClient,
    deadline: watch::Receiver<Instant>,
    started: Instant,
    finished: bool,
}

impl AnalysisStream {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// `Ok(Issues)` for partial batches, then `Ok(Completed)` or an error; `None` afterwards.
    pub async fn next(&mut self) -> Option<Result<AnalysisFragment>> {
        if self.finished {
            return None;
        }
        let received = tokio::select! {
            biased;
            fragment = self.rx.recv() => Some(fragment),
            _ = deadline_elapsed(self.deadline.clone()) => None,
        };
        match received {
            Some(Some(AnalysisFragment::Failed(err))) => {
                self.finished = true;
                Some(Err(err))
            }
            Some(Some(fragment)) => {
                if matches!(fragment, AnalysisFragment::Completed(_)) {
                    self.finished = true;
                }
                Some(Ok(fragment))
            }
            Some(None) => {
                self.finished = true;
                Some(Err(BridgeError::unavailable("analysis stream closed")))
            }
            None => {
                self.finished = true;
                self.client.cancel_analysis(self.correlation_id).await;
                let budget = self.deadline.borrow().saturating_duration_since(self.started);
                Some(Err(BridgeError::timeout("analysis", budget)))
            }
        }
    }

    /// Accumulates every batch into one normalized result.
    pub async fn collect(mut self) -> Result<AnalysisResult> {
        let mut issues = Vec::new();
        while let Some(fragment) = self.next().await {
            match fragment? {
                AnalysisFragment::Issues(batch) => issues.extend(batch),
                AnalysisFragment::Completed(status) => {
                    return Ok(AnalysisResult::new(status, issues))
                }
                AnalysisFragment::Failed(err) => return Err(err),
            }
        }
        Err(BridgeError::unavailable(
            "analysis stream ended without completion",
        ))
    }

    fn discard(&mut self) {
        self.finished = true;
        self.client.inner.lock().streams.cancel(self.correlation_id);
    }
}

impl Drop for AnalysisStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let client = self.client.clone();
        let correlation_id = self.correlation_id;
        client.inner.lock().streams.cancel(correlation_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { client.cancel_analysis(correlation_id).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sonar_mcp_protocol::{Severity, TextRange};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    /// Scripted peer: reads bridge frames line by line and writes raw replies.
    struct Peer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> RpcFrame {
            let line = self.lines.next_line().await.unwrap().unwrap();
            RpcFrame::parse(line.as_bytes()).unwrap()
        }

        async fn next_request(&mut self) -> (u64, String, Value) {
            match self.next_frame().await {
                RpcFrame::Request(req) => (req.id, req.method, req.params),
                other => panic!("expected request, got {other:?}"),
            }
        }

        async fn send(&mut self, value: Value) {
            let mut line = serde_json::to_vec(&value).unwrap();
            line.push(b'\n');
            self.write.write_all(&line).await.unwrap();
        }
    }

    fn connect() -> (RpcClient, Peer, mpsc::UnboundedReceiver<BackendEvent>) {
        let (bridge_side, peer_side) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(bridge_side);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = RpcClient::spawn(read, write, events_tx);
        let (peer_read, peer_write) = tokio::io::split(peer_side);
        let peer = Peer {
            lines: BufReader::new(peer_read).lines(),
            write: peer_write,
        };
        (client, peer, events_rx)
    }

    fn issue(line: u32) -> Value {
        serde_json::to_value(Issue {
            rule_key: "js:S1".to_string(),
            file_path: "a.js".to_string(),
            text_range: Some(TextRange::line(line)),
            severity: Severity::Minor,
            message: "m".to_string(),
        })
        .unwrap()
    }

    fn file_request() -> AnalysisRequest {
        AnalysisRequest {
            target: AnalysisTarget::File {
                path: "/tmp/a.js".into(),
            },
            language: Some("js".to_string()),
            profile: None,
        }
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_not_order() {
        let (client, mut peer, _events) = connect();
        let a = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_profile("a", Duration::from_secs(5)).await }
        });
        let (id_a, _, params_a) = peer.next_request().await;
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_profile("b", Duration::from_secs(5)).await }
        });
        let (id_b, _, params_b) = peer.next_request().await;
        assert_eq!(params_a["key"], "a");
        assert_eq!(params_b["key"], "b");
        assert!(id_b > id_a);

        let profile = |key: &str| {
            json!({ "profile": { "key": key, "name": key, "language": "js", "is_default": false, "active_rules": [] } })
        };
        peer.send(json!({ "jsonrpc": "2.0", "id": id_b, "result": profile("b") }))
            .await;
        peer.send(json!({ "jsonrpc": "2.0", "id": id_a, "result": profile("a") }))
            .await;

        assert_eq!(a.await.unwrap().unwrap().key, "a");
        assert_eq!(b.await.unwrap().unwrap().key, "b");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn backend_errors_are_surfaced_verbatim() {
        let (client, mut peer, _events) = connect();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_profile("nope", Duration::from_secs(5)).await }
        });
        let (id, _, _) = peer.next_request().await;
        peer.send(json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32002, "message": "Profile 'nope' not found" } }))
            .await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            BridgeError::BackendFailure {
                code: -32002,
                message: "Profile 'nope' not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn timed_out_call_ignores_late_reply() {
        let (client, mut peer, _events) = connect();
        let err = {
            let call = client.ping(Duration::from_millis(50));
            let (result, _) = tokio::join!(call, peer.next_request());
            result.unwrap_err()
        };
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");

        // The bridge tells the peer to abandon the request.
        match peer.next_frame().await {
            RpcFrame::Notification(note) => assert_eq!(note.method, methods::CANCEL_REQUEST),
            other => panic!("expected $/cancelRequest, got {other:?}"),
        }
        peer.send(json!({ "jsonrpc": "2.0", "id": 1, "result": { "bridge": "up" } }))
            .await;

        // The channel stays usable and the late reply went nowhere.
        let next = tokio::spawn({
            let client = client.clone();
            async move { client.ping(Duration::from_secs(5)).await }
        });
        let (id, method, _) = peer.next_request().await;
        assert_eq!(method, methods::PING);
        peer.send(json!({ "jsonrpc": "2.0", "id": id, "result": { "bridge": "unreachable" } }))
            .await;
        assert_eq!(next.await.unwrap().unwrap().bridge, BridgeHealth::Unreachable);
    }

    #[tokio::test]
    async fn backend_that_stops_reading_cannot_wedge_calls() {
        let (bridge_side, _stalled_peer) = tokio::io::duplex(16);
        let (read, write) = tokio::io::split(bridge_side);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let client = RpcClient::spawn(read, write, events_tx);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.ping(Duration::from_millis(50)),
        )
        .await
        .expect("ping hung on a backend that stopped reading");
        assert!(matches!(result, Err(BridgeError::Timeout { .. })), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(1));

        // A half-written frame poisons the channel for everyone after it.
        assert!(client.is_closed());
        assert!(matches!(
            client.ping(Duration::from_millis(50)).await,
            Err(BridgeError::BackendUnavailable { .. })
        ));
        assert!(matches!(
            client.notify(methods::CANCEL_REQUEST, &CancelRequestParams { id: 1 }).await,
            Err(BridgeError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn extended_deadline_keeps_the_stream_open() {
        let (client, mut peer, _events) = connect();
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + Duration::from_millis(150));
        let submit = tokio::spawn({
            let client = client.clone();
            async move { client.submit_until(file_request(), deadline_rx).await?.collect().await }
        });
        let (id, _, params) = peer.next_request().await;
        let cid = params["correlation_id"].as_u64().unwrap();
        peer.send(json!({ "jsonrpc": "2.0", "id": id, "result": { "accepted": true } }))
            .await;
        deadline_tx.send_replace(Instant::now() + Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(300)).await;
        peer.send(json!({ "jsonrpc": "2.0", "method": "analysis/issues", "params": { "correlation_id": cid, "issues": [issue(4)] } }))
            .await;
        peer.send(json!({ "jsonrpc": "2.0", "method": "analysis/completed", "params": { "correlation_id": cid, "status": "complete" } }))
            .await;

        let result = submit.await.unwrap().unwrap();
        assert_eq!(result.status, AnalysisStatus::Complete);
        assert_eq!(result.issues.len(), 1);
    }

    #[tokio::test]
    async fn analysis_stream_accumulates_batches() {
        let (client, mut peer, _events) = connect();
        let submit = tokio::spawn({
            let client = client.clone();
            async move {
                let stream = client
                    .submit(file_request(), Instant::now() + Duration::from_secs(5))
                    .await?;
                stream.collect().await
            }
        });
        let (id, method, params) = peer.next_request().await;
        assert_eq!(method, methods::SUBMIT);
        let cid = params["correlation_id"].as_u64().unwrap();
        peer.send(json!({ "jsonrpc": "2.0", "id": id, "result": { "accepted": true } }))
            .await;
        peer.send(json!({ "jsonrpc": "2.0", "method": "analysis/issues", "params": { "correlation_id": cid, "issues": [issue(9), issue(2)] } }))
            .await;
        peer.send(json!({ "jsonrpc": "2.0", "method": "analysis/issues", "params": { "correlation_id": cid, "issues": [issue(2)] } }))
            .await;
        peer.send(json!({ "jsonrpc": "2.0", "method": "analysis/completed", "params": { "correlation_id": cid, "status": "complete" } }))
            .await;
        // Stray completion for the same id after the terminal one.
        peer.send(json!({ "jsonrpc": "2.0", "method": "analysis/completed", "params": { "correlation_id": cid, "status": "failed" } }))
            .await;

        let result = submit.await.unwrap().unwrap();
        assert_eq!(result.status, AnalysisStatus::Complete);
        let lines: Vec<u32> = result
            .issues
            .iter()
            .filter_map(|i| i.text_range.map(|r| r.start_line))
            .collect();
        assert_eq!(lines, vec![2, 9]);
    }

    #[tokio::test]
    async fn stream_deadline_cancels_on_backend() {
        let (client, mut peer, _events) = connect();
        let submit = tokio::spawn({
            let client = client.clone();
            async move {
                let stream = client
                    .submit(file_request(), Instant::now() + Duration::from_millis(200))
                    .await?;
                stream.collect().await
            }
        });
        let (id, _, params) = peer.next_request().await;
        let cid = params["correlation_id"].as_u64().unwrap();
        peer.send(json!({ "jsonrpc": "2.0", "id": id, "result": { "accepted": true } }))
            .await;

        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
        match peer.next_frame().await {
            RpcFrame::Notification(note) => {
                assert_eq!(note.method, methods::CANCEL);
                assert_eq!(note.params["correlation_id"], cid);
            }
            other => panic!("expected analysis/cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_channel_fails_pending_work() {
        let (client, mut peer, mut events) = connect();
        let submit = tokio::spawn({
            let client = client.clone();
            async move {
                let stream = client
                    .submit(file_request(), Instant::now() + Duration::from_secs(5))
                    .await?;
                stream.collect().await
            }
        });
        let (id, _, _) = peer.next_request().await;
        peer.send(json!({ "jsonrpc": "2.0", "id": id, "result": { "accepted": true } }))
            .await;
        drop(peer);

        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }), "{err:?}");
        assert!(matches!(
            events.recv().await,
            Some(BackendEvent::Closed { .. })
        ));
        assert!(client.is_closed());
        assert!(matches!(
            client.ping(Duration::from_secs(1)).await,
            Err(BridgeError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn bridge_status_notifications_become_events() {
        let (_client, mut peer, mut events) = connect();
        peer.send(json!({ "jsonrpc": "2.0", "method": "bridge/status", "params": { "bridge": "unreachable", "detail": "node exited" } }))
            .await;
        assert_eq!(
            events.recv().await,
            Some(BackendEvent::BridgeStatus {
                health: BridgeHealth::Unreachable,
                detail: Some("node exited".to_string())
            })
        );
    }
}
