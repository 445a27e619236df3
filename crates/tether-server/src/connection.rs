//! The per-connection read loop and its teardown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tether_core::errors::{ErrorInfo, INTERNAL_ERROR};
use tether_core::envelope::ResponseKind;
use tether_core::{decode, encode, ResponseEnvelope, SessionId};
use tether_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::registry::ConnectionRegistry;
use crate::session::ConnectionSession;
use crate::transport::{Frame, Transport};

pub const CONNECTIONS_OPENED_TOTAL: &str = "tether_connections_opened_total";
pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
pub const DECODE_ERRORS_TOTAL: &str = "tether_decode_errors_total";

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of the outbound envelope queue.
    pub max_send_queue: usize,
    /// `None` disables pings.
    pub heartbeat_interval: Option<Duration>,
    /// How long teardown waits for cancelled operations to finish.
    pub drain_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            heartbeat_interval: Some(Duration::from_secs(30)),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything a connection loop shares with the rest of the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ConnectionRegistry>,
    pub settings: ConnectionSettings,
    pub metrics: Option<Arc<MetricsRecorder>>,
    /// Server-wide shutdown; each session gets a child of it.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    PeerClosed,
    TransportFailed,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportFailed => "transport_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct ConnectionSummary {
    pub session_id: SessionId,
    pub reason: ExitReason,
    /// Operations still in flight when the loop exited.
    pub cancelled: usize,
    /// False if some runner outlived the drain timeout.
    pub drained: bool,
}

/// Cancels and unregisters the session even if the loop future is dropped
/// before it reaches its own teardown.
struct SessionGuard {
    session: Arc<ConnectionSession>,
    registry: Arc<ConnectionRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.cancel_all();
        self.registry.unregister(self.session.id());
        if let Some(m) = &self.metrics {
            m.add_gauge(CONNECTIONS_ACTIVE, &[], -1.0);
        }
    }
}

/// Run one connection to completion: read frames, dispatch requests, write
/// responses, then tear the session down.
pub async fn serve_connection<T: Transport>(mut transport: T, ctx: &ConnectionContext) -> ConnectionSummary {
    let (tx, mut rx) = mpsc::channel(ctx.settings.max_send_queue.max(1));
    let session = ConnectionSession::create(tx, ctx.shutdown.child_token());
    ctx.registry.register(Arc::clone(&session));

    if let Some(m) = &ctx.metrics {
        m.increment_counter(CONNECTIONS_OPENED_TOTAL, &[], 1);
        m.add_gauge(CONNECTIONS_ACTIVE, &[], 1.0);
    }
    let guard = SessionGuard {
        session: Arc::clone(&session),
        registry: Arc::clone(&ctx.registry),
        metrics: ctx.metrics.clone(),
    };

    tracing::info!(session_id = %session.id(), "Connection opened");

    let mut heartbeat = ctx.settings.heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    // Outbound is polled ahead of inbound so a busy client can't starve its
    // own responses.
    let reason = loop {
        tokio::select! {
            biased;
            () = session.shutdown_token().cancelled() => break ExitReason::Shutdown,
            Some(envelope) = rx.recv() => {
                if !send_envelope(&mut transport, &session, &envelope).await {
                    break ExitReason::TransportFailed;
                }
            }
            frame = transport.read_frame() => match frame {
                Frame::Text(text) => {
                    session.touch();
                    if !handle_text(&mut transport, &mut rx, ctx, &session, &text).await {
                        break ExitReason::TransportFailed;
                    }
                }
                Frame::Binary(len) => {
                    session.touch();
                    tracing::debug!(session_id = %session.id(), len, "Ignoring binary frame");
                }
                Frame::Control => session.touch(),
                Frame::Closed => break ExitReason::PeerClosed,
                Frame::Error(e) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "Transport error");
                    if e.is_fatal() || transport.is_closed() {
                        break ExitReason::TransportFailed;
                    }
                }
            },
            () = next_heartbeat(&mut heartbeat) => {
                if let Err(e) = transport.ping().await {
                    tracing::warn!(session_id = %session.id(), error = %e, "Heartbeat ping failed");
                    if e.is_fatal() || transport.is_closed() {
                        break ExitReason::TransportFailed;
                    }
                } else {
                    tracing::trace!(session_id = %session.id(), "Sent ping");
                }
            }
        }
    };

    if !transport.is_closed() {
        transport.close().await;
    }
    let cancelled = session.cancel_all();
    // Runners blocked on a full queue must not hold up the drain.
    rx.close();
    let drained = session.drain(ctx.settings.drain_timeout).await;
    if !drained {
        tracing::warn!(
            session_id = %session.id(),
            timeout_ms = ctx.settings.drain_timeout.as_millis() as u64,
            "Operations still running after drain timeout"
        );
    }
    drop(guard);

    tracing::info!(
        session_id = %session.id(),
        reason = reason.as_str(),
        cancelled,
        "Connection closed"
    );

    ConnectionSummary {
        session_id: session.id().clone(),
        reason,
        cancelled,
        drained,
    }
}

/// Decode and dispatch one text frame. Every failure turns into an error
/// envelope; returns false only when the transport became unusable.
///
/// Errors are written straight to the transport, after whatever runners have
/// already queued.
async fn handle_text<T: Transport>(
    transport: &mut T,
    rx: &mut mpsc::Receiver<ResponseEnvelope>,
    ctx: &ConnectionContext,
    session: &Arc<ConnectionSession>,
    text: &str,
) -> bool {
    let request = match decode(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(session_id = %session.id(), reason = %e.reason, "Undecodable frame");
            if let Some(m) = &ctx.metrics {
                m.increment_counter(DECODE_ERRORS_TOTAL, &[], 1);
            }
            if !flush_queued(transport, rx, session).await {
                return false;
            }
            return send_frame(transport, session, e.to_frame(), ResponseKind::Error, "").await;
        }
    };

    let uid = request.operation_id().clone();
    let kind = request.kind();
    let dispatched =
        std::panic::catch_unwind(AssertUnwindSafe(|| ctx.dispatcher.dispatch(session, request)));

    let info = match dispatched {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => {
            tracing::debug!(session_id = %session.id(), uid = %uid, kind = kind.as_str(), error = %e, "Request rejected");
            e.to_error_info()
        }
        Err(_) => {
            tracing::error!(session_id = %session.id(), uid = %uid, kind = kind.as_str(), "Dispatch panicked");
            ErrorInfo::new(INTERNAL_ERROR, "internal error while dispatching request")
        }
    };
    flush_queued(transport, rx, session).await
        && send_envelope(transport, session, &ResponseEnvelope::error(Some(uid), info)).await
}

/// Write every envelope already sitting in the outbound queue.
async fn flush_queued<T: Transport>(
    transport: &mut T,
    rx: &mut mpsc::Receiver<ResponseEnvelope>,
    session: &ConnectionSession,
) -> bool {
    while let Ok(envelope) = rx.try_recv() {
        if !send_envelope(transport, session, &envelope).await {
            return false;
        }
    }
    true
}

/// Write one envelope. Failures are logged; returns false only when the
/// transport reports it can no longer be used.
async fn send_envelope<T: Transport>(
    transport: &mut T,
    session: &ConnectionSession,
    envelope: &ResponseEnvelope,
) -> bool {
    let uid = envelope.uid().map(|u| u.as_str()).unwrap_or("");
    send_frame(transport, session, encode(envelope), envelope.kind(), uid).await
}

async fn send_frame<T: Transport>(
    transport: &mut T,
    session: &ConnectionSession,
    frame: String,
    kind: ResponseKind,
    uid: &str,
) -> bool {
    match transport.send_text(frame).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                session_id = %session.id(),
                kind = kind.as_str(),
                uid,
                error = %e,
                "Failed to send response"
            );
            !(e.is_fatal() || transport.is_closed())
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use serde_json::{json, Value};
    use tether_core::{OperationContext, OperationError, StaticRegistry, Target};
    use tokio::task::JoinHandle;

    use crate::runner::RunnerOptions;
    use crate::transport::memory::{pair, Peer};

    fn registry() -> StaticRegistry {
        let mut r = StaticRegistry::new();
        r.register_fn(Target::new("dev1", "sensor", "read"), |_ctx: OperationContext| async {
            Ok(json!({"temp": 21}))
        });
        r.register_fn(Target::new("dev1", "sensor", "slow"), |ctx: OperationContext| async move {
            ctx.cancel.cancelled().await;
            Err(OperationError::Cancelled)
        });
        r.register_fn(Target::new("dev1", "sensor", "panic"), |_ctx: OperationContext| async {
            if true {
                panic!("driver crashed");
            }
            Ok(Value::Null)
        });
        r
    }

    fn context(heartbeat: Option<Duration>) -> ConnectionContext {
        let options = RunnerOptions {
            include_stat: false,
            metrics: None,
        };
        ConnectionContext {
            dispatcher: Arc::new(Dispatcher::new(Arc::new(registry()), options)),
            registry: Arc::new(ConnectionRegistry::new()),
            settings: ConnectionSettings {
                max_send_queue: 16,
                heartbeat_interval: heartbeat,
                drain_timeout: Duration::from_secs(1),
            },
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    fn spawn(ctx: &ConnectionContext) -> (JoinHandle<ConnectionSummary>, Peer) {
        let (transport, peer) = pair();
        let ctx = ctx.clone();
        let handle = tokio::spawn(async move { serve_connection(transport, &ctx).await });
        (handle, peer)
    }

    async fn wait_for_registration(ctx: &ConnectionContext) -> SessionId {
        for _ in 0..100 {
            if let Some(id) = ctx.registry.session_ids().into_iter().next() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never registered");
    }

    #[tokio::test]
    async fn happy_path_returns_success() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"1","type":"call","name":"dev1/sensor/read","data":{}}"#);
        assert_eq!(
            peer.recv_json().await,
            json!({"type": "success", "uid": "1", "data": {"temp": 21}})
        );

        peer.frames.send(Frame::Closed).unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, ExitReason::PeerClosed);
    }

    #[tokio::test]
    async fn cancel_flow_yields_single_cancel() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"2","type":"call","name":"dev1/sensor/slow","data":{}}"#);
        peer.send_text(r#"{"uid":"2","type":"cancel"}"#);
        assert_eq!(peer.recv_json().await, json!({"type": "cancel", "uid": "2"}));

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
        assert!(peer.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_target_keeps_connection_open() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"7","type":"call","name":"badformat","data":{}}"#);
        let resp = peer.recv_json().await;
        assert_eq!(resp["type"], "error");
        assert_eq!(resp["uid"], "7");
        assert_eq!(resp["data"]["code"], "MALFORMED_TARGET");

        peer.send_text(r#"{"uid":"8","type":"call","name":"dev1/sensor/read","data":{}}"#);
        assert_eq!(peer.recv_json().await["type"], "success");

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_frame_then_valid_frame() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text("not-json");
        let resp = peer.recv_json().await;
        assert_eq!(resp["type"], "error");
        assert_eq!(resp["uid"], Value::Null);
        assert_eq!(resp["data"]["code"], "DECODE_ERROR");

        peer.send_text(r#"{"uid":"1","type":"call","name":"dev1/sensor/read","data":{}}"#);
        assert_eq!(peer.recv_json().await["type"], "success");
        assert!(peer.sent.try_recv().is_err());

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_for_unknown_uid_is_error_with_uid() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"ghost","type":"cancel"}"#);
        let resp = peer.recv_json().await;
        assert_eq!(resp["type"], "error");
        assert_eq!(resp["uid"], "ghost");
        assert_eq!(resp["data"]["code"], "OPERATION_NOT_FOUND");

        peer.frames.send(Frame::Closed).unwrap();
        assert_eq!(handle.await.unwrap().reason, ExitReason::PeerClosed);
    }

    #[tokio::test]
    async fn panicking_operation_reports_error() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"p","type":"call","name":"dev1/sensor/panic","data":{}}"#);
        let resp = peer.recv_json().await;
        assert_eq!(resp["type"], "error");
        assert_eq!(resp["uid"], "p");
        assert_eq!(resp["data"]["action"], "dev1/sensor/panic");

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn teardown_cancels_everything_and_unregisters() {
        let ctx = context(None);
        let (handle, peer) = spawn(&ctx);

        for i in 0..5 {
            peer.send_text(&format!(
                r#"{{"uid":"{i}","type":"call","name":"dev1/sensor/slow","data":{{}}}}"#
            ));
        }
        let id = wait_for_registration(&ctx).await;
        let session = ctx.registry.get(&id).unwrap();
        for _ in 0..100 {
            if session.operation_count() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.operation_count(), 5);

        peer.frames.send(Frame::Closed).unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.cancelled, 5);
        assert!(summary.drained);
        assert_eq!(session.operation_count(), 0);
        assert!(session.is_closing());
        assert!(!ctx.registry.contains(&id));
        assert!(peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_failure_does_not_end_loop() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.fail_sends.store(true, Ordering::SeqCst);
        peer.send_text("not-json");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        peer.fail_sends.store(false, Ordering::SeqCst);
        peer.send_text(r#"{"uid":"1","type":"call","name":"dev1/sensor/read","data":{}}"#);
        assert_eq!(peer.recv_json().await["type"], "success");

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn non_fatal_transport_error_is_tolerated() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.frames
            .send(Frame::Error(crate::error::TransportError::Io {
                message: "hiccup".into(),
                fatal: false,
            }))
            .unwrap();
        peer.send_text(r#"{"uid":"1","type":"call","name":"dev1/sensor/read","data":{}}"#);
        assert_eq!(peer.recv_json().await["type"], "success");

        peer.frames
            .send(Frame::Error(crate::error::TransportError::Io {
                message: "reset".into(),
                fatal: true,
            }))
            .unwrap();
        assert_eq!(handle.await.unwrap().reason, ExitReason::TransportFailed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_cancel_never_overtakes_result() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"r","type":"call","name":"dev1/sensor/read","data":{}}"#);
        for _ in 0..500 {
            peer.send_text("not-json");
        }
        peer.send_text(r#"{"uid":"r","type":"cancel"}"#);
        peer.send_text(r#"{"uid":"z","type":"call","name":"dev1/sensor/read","data":{}}"#);

        let mut seen = Vec::new();
        loop {
            let resp = peer.recv_json().await;
            if resp["uid"] == "z" {
                break;
            }
            seen.push(resp);
        }

        let for_r: Vec<&Value> = seen.iter().filter(|r| r["uid"] == "r").collect();
        assert_eq!(for_r[0]["type"], "success", "responses for r: {for_r:?}");
        let terminal = for_r.iter().filter(|r| r["type"] != "error").count();
        assert_eq!(terminal, 1);
        // At most the reply to the late cancel follows.
        assert!(for_r.len() <= 2, "responses for r: {for_r:?}");
        if let Some(late) = for_r.get(1) {
            assert_eq!(late["data"]["code"], "OPERATION_NOT_FOUND");
        }

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn responses_are_written_during_inbound_burst() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"r","type":"call","name":"dev1/sensor/read","data":{}}"#);
        for _ in 0..500 {
            peer.send_text("not-json");
        }

        let mut decode_errors_before = 0;
        loop {
            let resp = peer.recv_json().await;
            if resp["uid"] == "r" {
                assert_eq!(resp["type"], "success");
                break;
            }
            decode_errors_before += 1;
        }
        assert!(
            decode_errors_before < 500,
            "success waited for the whole burst ({decode_errors_before} errors first)"
        );

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_shutdown_exits_loop() {
        let ctx = context(None);
        let (handle, peer) = spawn(&ctx);

        peer.send_text(r#"{"uid":"s","type":"call","name":"dev1/sensor/slow","data":{}}"#);
        let id = wait_for_registration(&ctx).await;

        ctx.shutdown.cancel();
        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, ExitReason::Shutdown);
        assert_eq!(summary.session_id, id);
        assert_eq!(ctx.registry.count(), 0);
    }

    #[tokio::test]
    async fn registry_push_reaches_client() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        let id = wait_for_registration(&ctx).await;
        ctx.registry.push(&id, json!({"event": "door_open"})).unwrap();
        assert_eq!(
            peer.recv_json().await,
            json!({"type": "notify", "data": {"event": "door_open"}})
        );

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn binary_and_control_frames_are_ignored() {
        let ctx = context(None);
        let (handle, mut peer) = spawn(&ctx);

        peer.frames.send(Frame::Binary(12)).unwrap();
        peer.frames.send(Frame::Control).unwrap();
        peer.send_text(r#"{"uid":"1","type":"call","name":"dev1/sensor/read","data":{}}"#);
        assert_eq!(peer.recv_json().await["type"], "success");

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_sends_pings() {
        let ctx = context(Some(Duration::from_millis(10)));
        let (handle, peer) = spawn(&ctx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(peer.pings.load(Ordering::SeqCst) >= 2);

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn connection_metrics_are_recorded() {
        let metrics = Arc::new(MetricsRecorder::new());
        let mut ctx = context(None);
        ctx.metrics = Some(Arc::clone(&metrics));
        let (handle, mut peer) = spawn(&ctx);

        peer.send_text("{}");
        let _ = peer.recv_json().await;
        assert!((metrics.gauge(CONNECTIONS_ACTIVE, &[]) - 1.0).abs() < f64::EPSILON);

        peer.frames.send(Frame::Closed).unwrap();
        handle.await.unwrap();
        assert_eq!(metrics.counter(CONNECTIONS_OPENED_TOTAL, &[]), 1);
        assert_eq!(metrics.counter(DECODE_ERRORS_TOTAL, &[]), 1);
        assert!(metrics.gauge(CONNECTIONS_ACTIVE, &[]).abs() < f64::EPSILON);
    }
}
