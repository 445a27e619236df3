pub mod envelope;
pub mod errors;
pub mod ids;
pub mod operation;
pub mod target;

pub use envelope::{decode, encode, DecodeError, RequestEnvelope, RequestKind, ResponseEnvelope};
pub use errors::{ErrorInfo, OperationError, OperationFailure};
pub use ids::{OperationId, SessionId};
pub use operation::{
    Notifier, Operation, OperationContext, OperationRegistry, OperationResult, Outcome,
    StaticRegistry,
};
pub use target::{Target, TargetError};
