//! Supervises one dispatched operation to its terminal response.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tether_core::envelope::Stat;
use tether_core::{OperationFailure, OperationId, OperationResult, Outcome, ResponseEnvelope};
use tether_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;

use crate::session::ConnectionSession;

pub const OPERATIONS_TOTAL: &str = "tether_operations_total";
pub const OPERATION_DURATION_MS: &str = "tether_operation_duration_ms";
pub const OPERATIONS_ACTIVE: &str = "tether_operations_active";

/// Settings shared by every runner on a server.
#[derive(Clone, Default)]
pub struct RunnerOptions {
    pub include_stat: bool,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

/// One unit of work handed from the dispatcher to [`run`].
pub struct Job {
    pub uid: OperationId,
    pub generation: u64,
    pub target: String,
    pub cancel: CancellationToken,
    pub work: BoxFuture<'static, OperationResult>,
}

/// Removes the tracking entry and releases the active-operations gauge when
/// dropped, so both happen even if the runner itself is aborted.
struct TrackingGuard<'a> {
    session: &'a ConnectionSession,
    uid: OperationId,
    generation: u64,
    metrics: Option<&'a MetricsRecorder>,
}

impl Drop for TrackingGuard<'_> {
    fn drop(&mut self) {
        self.session.untrack_generation(&self.uid, self.generation);
        if let Some(m) = self.metrics {
            m.add_gauge(OPERATIONS_ACTIVE, &[], -1.0);
        }
    }
}

/// Await the job, turn its terminal state into exactly one response, and
/// untrack it once that response is in the outbound queue.
///
/// A `cancel` that finds the uid still tracked is absorbed; one that finds it
/// gone is answered by the loop, which flushes the queue first. Either way the
/// terminal response reaches the client before anything else about this uid.
pub async fn run(session: Arc<ConnectionSession>, job: Job, options: RunnerOptions) {
    let Job {
        uid,
        generation,
        target,
        cancel,
        work,
    } = job;

    if let Some(m) = &options.metrics {
        m.add_gauge(OPERATIONS_ACTIVE, &[], 1.0);
    }

    let guard = TrackingGuard {
        session: &session,
        uid: uid.clone(),
        generation,
        metrics: options.metrics.as_deref(),
    };

    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = supervise(work, &cancel).await;
    let elapsed = clock.elapsed();
    let finished_at = Utc::now();

    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match &outcome {
        Outcome::Completed(_) => {
            tracing::debug!(session_id = %session.id(), uid = %uid, target = %target, duration_ms, "Operation completed");
        }
        Outcome::Cancelled => {
            tracing::debug!(session_id = %session.id(), uid = %uid, target = %target, duration_ms, "Operation cancelled");
        }
        Outcome::Failed(failure) => {
            tracing::warn!(session_id = %session.id(), uid = %uid, target = %target, duration_ms, failure = ?failure, "Operation failed");
        }
    }

    if let Some(m) = &options.metrics {
        m.increment_counter(OPERATIONS_TOTAL, &[("outcome", outcome.label())], 1);
        m.observe(OPERATION_DURATION_MS, &[], elapsed.as_secs_f64() * 1000.0);
    }

    let stat = options.include_stat.then(|| Stat {
        started_at,
        finished_at,
        duration_ms,
    });
    let envelope = into_envelope(uid, &target, outcome, stat);

    if let Err(e) = session.outbound().send(envelope).await {
        let kind = e.0.kind().as_str();
        tracing::debug!(session_id = %session.id(), kind, "Connection gone, dropping response");
    }
    drop(guard);
}

/// Await `work` unless `cancel` fires first. Panics surface as opaque
/// failures.
async fn supervise(work: BoxFuture<'static, OperationResult>, cancel: &CancellationToken) -> Outcome {
    let guarded = AssertUnwindSafe(work).catch_unwind();
    tokio::select! {
        biased;
        () = cancel.cancelled() => Outcome::Cancelled,
        result = guarded => match result {
            Ok(result) => Outcome::from(result),
            Err(panic) => Outcome::Failed(OperationFailure::from_panic(panic.as_ref())),
        },
    }
}

fn into_envelope(
    uid: OperationId,
    target: &str,
    outcome: Outcome,
    stat: Option<Stat>,
) -> ResponseEnvelope {
    match outcome {
        Outcome::Completed(data) => ResponseEnvelope::success(uid, data, stat),
        Outcome::Cancelled => ResponseEnvelope::cancelled(uid),
        Outcome::Failed(failure) => {
            ResponseEnvelope::error(Some(uid), failure.into_error_info().or_action(target))
        }
    }
}
