//! The boundary to backend business logic.
//!
//! A [`OperationRegistry`] resolves a parsed [`Target`] to an [`Operation`];
//! the server invokes it with an [`OperationContext`] and supervises the
//! returned future.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::{RequestKind, ResponseEnvelope};
use crate::errors::{OperationError, OperationFailure};
use crate::ids::{OperationId, SessionId};
use crate::target::Target;

pub type OperationResult = Result<Value, OperationError>;

/// Terminal state of one operation. Each variant maps to exactly one
/// response kind: `success`, `cancel`, `error`.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Cancelled,
    Failed(OperationFailure),
}

impl From<OperationResult> for Outcome {
    fn from(result: OperationResult) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(OperationError::Cancelled) => Self::Cancelled,
            Err(OperationError::Structured(info)) => {
                Self::Failed(OperationFailure::Structured(info))
            }
            Err(OperationError::Opaque(err)) => Self::Failed(OperationFailure::from_anyhow(&err)),
        }
    }
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "success",
            Self::Cancelled => "cancel",
            Self::Failed(_) => "error",
        }
    }
}

/// Pushes `notify` envelopes tagged with the operation's uid onto the
/// connection that started it.
#[derive(Clone, Debug)]
pub struct Notifier {
    uid: OperationId,
    tx: mpsc::Sender<ResponseEnvelope>,
}

impl Notifier {
    pub fn new(uid: OperationId, tx: mpsc::Sender<ResponseEnvelope>) -> Self {
        Self { uid, tx }
    }

    /// Returns false once the connection is gone.
    pub async fn notify(&self, data: Value) -> bool {
        self.tx
            .send(ResponseEnvelope::Notify {
                uid: Some(self.uid.clone()),
                data,
            })
            .await
            .is_ok()
    }
}

/// Everything an operation gets to see about the call that started it.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub session_id: SessionId,
    pub operation_id: OperationId,
    pub target: Target,
    pub payload: Value,
    /// Tripped by a `cancel` request or connection teardown.
    pub cancel: CancellationToken,
    pub notifier: Notifier,
}

impl OperationContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` if the token has been tripped; handy with `?` at
    /// cooperative checkpoints.
    pub fn checkpoint(&self) -> Result<(), OperationError> {
        if self.cancel.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One backend operation.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn invoke(&self, ctx: OperationContext) -> OperationResult;
}

/// Adapter so plain async closures can be registered.
pub struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    async fn invoke(&self, ctx: OperationContext) -> OperationResult {
        (self.0)(ctx).await
    }
}

/// Resolves targets to operations.
pub trait OperationRegistry: Send + Sync {
    fn resolve(&self, target: &Target, kind: RequestKind) -> Option<Arc<dyn Operation>>;
}

/// A fixed map of targets to operations.
#[derive(Default)]
pub struct StaticRegistry {
    operations: HashMap<Target, Arc<dyn Operation>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, replacing any previous one at the same target.
    pub fn register(&mut self, target: Target, operation: Arc<dyn Operation>) {
        self.operations.insert(target, operation);
    }

    pub fn register_fn<F, Fut>(&mut self, target: Target, f: F)
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        self.register(target, Arc::new(FnOperation(f)));
    }

    /// Merge another registry in; its entries win on conflict.
    pub fn extend(&mut self, other: StaticRegistry) {
        self.operations.extend(other.operations);
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.operations.contains_key(target)
    }

    /// Registered targets, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().map(ToString::to_string).collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.operations.len()
    }
}

impl OperationRegistry for StaticRegistry {
    fn resolve(&self, target: &Target, kind: RequestKind) -> Option<Arc<dyn Operation>> {
        match kind {
            RequestKind::Call => self.operations.get(target).cloned(),
            RequestKind::Cancel => None,
        }
    }
}
