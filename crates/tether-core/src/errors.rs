use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

// Wire error codes. Stable strings; clients match on these.
pub const DECODE_ERROR: &str = "DECODE_ERROR";
pub const MALFORMED_TARGET: &str = "MALFORMED_TARGET";
pub const OPERATION_NOT_FOUND: &str = "OPERATION_NOT_FOUND";
pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
pub const DUPLICATE_OPERATION: &str = "DUPLICATE_OPERATION";
pub const CONNECTION_CLOSING: &str = "CONNECTION_CLOSING";
pub const OPERATION_FAILED: &str = "OPERATION_FAILED";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Machine-readable failure description carried in the `data` of an
/// `error` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// The `owner/entity/action` the failure happened in, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            action: None,
            cause: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Fill in `action` only if the failure didn't already name one.
    pub fn or_action(mut self, action: impl Into<String>) -> Self {
        if self.action.is_none() {
            self.action = Some(action.into());
        }
        self
    }

    /// Walk the cause chain, outermost first (excluding `self`).
    pub fn causes(&self) -> impl Iterator<Item = &ErrorInfo> {
        std::iter::successors(self.cause.as_deref(), |c| c.cause.as_deref())
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// What a backend operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Not a failure: the operation noticed its cancellation token and bailed.
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Structured(ErrorInfo),
    #[error(transparent)]
    Opaque(#[from] anyhow::Error),
}

impl OperationError {
    pub fn structured(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structured(ErrorInfo::new(code, message))
    }
}

impl From<ErrorInfo> for OperationError {
    fn from(info: ErrorInfo) -> Self {
        Self::Structured(info)
    }
}

/// A failed operation, normalised at the backend call boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationFailure {
    Structured(ErrorInfo),
    Opaque { message: String, causes: Vec<String> },
}

impl OperationFailure {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::Opaque {
            message: err.to_string(),
            causes: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    /// Build an opaque failure from a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "operation panicked".to_string()
        };
        Self::Opaque {
            message: format!("panic: {message}"),
            causes: Vec::new(),
        }
    }

    /// Convert to the wire shape. Opaque cause chains become nested
    /// `INTERNAL_ERROR` entries.
    pub fn into_error_info(self) -> ErrorInfo {
        match self {
            Self::Structured(info) => info,
            Self::Opaque { message, causes } => {
                let cause = causes
                    .into_iter()
                    .rev()
                    .fold(None, |inner: Option<ErrorInfo>, msg| {
                        let mut info = ErrorInfo::new(INTERNAL_ERROR, msg);
                        info.cause = inner.map(Box::new);
                        Some(info)
                    });
                let mut info = ErrorInfo::new(INTERNAL_ERROR, message);
                info.cause = cause.map(Box::new);
                info
            }
        }
    }
}
