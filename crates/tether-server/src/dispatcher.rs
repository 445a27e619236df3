//! Routes decoded requests: `call` starts a tracked operation, `cancel`
//! trips one.

use std::sync::Arc;

use futures::FutureExt;
use tether_core::envelope::{CallRequest, CancelRequest};
use tether_core::{
    Notifier, OperationContext, OperationRegistry, RequestEnvelope, RequestKind, Target,
};

use crate::error::DispatchError;
use crate::runner::{self, Job, RunnerOptions};
use crate::session::{ConnectionSession, TrackedOperation};

pub const DISPATCH_ERRORS_TOTAL: &str = "tether_dispatch_errors_total";

pub struct Dispatcher {
    registry: Arc<dyn OperationRegistry>,
    options: RunnerOptions,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn OperationRegistry>, options: RunnerOptions) -> Self {
        Self { registry, options }
    }

    pub fn dispatch(
        &self,
        session: &Arc<ConnectionSession>,
        request: RequestEnvelope,
    ) -> Result<(), DispatchError> {
        let result = match request {
            RequestEnvelope::Call(call) => self.dispatch_call(session, call),
            RequestEnvelope::Cancel(cancel) => self.dispatch_cancel(session, &cancel),
        };
        if let (Err(e), Some(m)) = (&result, &self.options.metrics) {
            m.increment_counter(DISPATCH_ERRORS_TOTAL, &[("code", e.code())], 1);
        }
        result
    }

    /// Resolve the target, track the uid, then spawn the runner. Tracking
    /// happens before the spawn so an instantly finishing operation can't
    /// leave a stale entry.
    pub fn dispatch_call(
        &self,
        session: &Arc<ConnectionSession>,
        call: CallRequest,
    ) -> Result<(), DispatchError> {
        if session.is_closing() {
            return Err(DispatchError::ConnectionClosing);
        }

        let target = Target::parse(&call.name)?;
        let operation = self
            .registry
            .resolve(&target, RequestKind::Call)
            .ok_or_else(|| DispatchError::UnknownAction(target.to_string()))?;

        let cancel = session.shutdown_token().child_token();
        let target_name = target.to_string();
        let generation = session.track(
            call.uid.clone(),
            TrackedOperation::new(target_name.clone(), cancel.clone()),
        )?;

        let ctx = OperationContext {
            session_id: session.id().clone(),
            operation_id: call.uid.clone(),
            target,
            payload: call.data,
            cancel: cancel.clone(),
            notifier: Notifier::new(call.uid.clone(), session.outbound().clone()),
        };
        let work = async move { operation.invoke(ctx).await }.boxed();

        tracing::debug!(session_id = %session.id(), uid = %call.uid, target = %target_name, "Dispatching call");

        let job = Job {
            uid: call.uid,
            generation,
            target: target_name,
            cancel,
            work,
        };
        session
            .tasks()
            .spawn(runner::run(Arc::clone(session), job, self.options.clone()));
        Ok(())
    }

    /// Advisory: the runner emits the `cancel` response once it notices.
    pub fn dispatch_cancel(
        &self,
        session: &ConnectionSession,
        request: &CancelRequest,
    ) -> Result<(), DispatchError> {
        if session.cancel(&request.uid) {
            tracing::debug!(session_id = %session.id(), uid = %request.uid, "Cancellation requested");
            Ok(())
        } else {
            Err(DispatchError::OperationNotFound(request.uid.clone()))
        }
    }
}
