use tether_core::errors::{
    ErrorInfo, CONNECTION_CLOSING, DUPLICATE_OPERATION, MALFORMED_TARGET, OPERATION_NOT_FOUND,
    UNKNOWN_ACTION,
};
use tether_core::{OperationId, TargetError};

/// A request rejected before any work was started. Terminal for the
/// request, never for the connection.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    MalformedTarget(#[from] TargetError),

    #[error("no operation in flight with uid {0}")]
    OperationNotFound(OperationId),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("operation {0} is already in flight")]
    DuplicateOperation(OperationId),

    #[error("connection is closing")]
    ConnectionClosing,
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedTarget(_) => MALFORMED_TARGET,
            Self::OperationNotFound(_) => OPERATION_NOT_FOUND,
            Self::UnknownAction(_) => UNKNOWN_ACTION,
            Self::DuplicateOperation(_) => DUPLICATE_OPERATION,
            Self::ConnectionClosing => CONNECTION_CLOSING,
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.code(), self.to_string());
        match self {
            Self::UnknownAction(action) => info.with_action(action.clone()),
            _ => info,
        }
    }
}

/// Errors raised by the transport layer under a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {message}")]
    Io { message: String, fatal: bool },
}

impl TransportError {
    /// Whether the channel is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io { fatal, .. } => *fatal,
        }
    }
}

/// Errors from loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}
