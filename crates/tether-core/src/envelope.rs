//! Wire envelopes and the text-frame codec.
//!
//! Requests: `{"uid": "...", "type": "call"|"cancel", "name": "owner/entity/action", "data": ...}`
//!
//! Responses: `{"type": "success"|"cancel"|"error"|"notify", "uid": ..., "data": ..., "stat": ...}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorInfo, DECODE_ERROR, INTERNAL_ERROR};
use crate::ids::OperationId;

/// Inbound envelope. The `type` field selects the variant.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestEnvelope {
    Call(CallRequest),
    Cancel(CancelRequest),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CallRequest {
    pub uid: OperationId,
    /// Unparsed target; parsing happens at dispatch so a bad name can still
    /// be answered with this request's uid.
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CancelRequest {
    pub uid: OperationId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Call,
    Cancel,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Cancel => "cancel",
        }
    }
}

impl RequestEnvelope {
    pub fn operation_id(&self) -> &OperationId {
        match self {
            Self::Call(c) => &c.uid,
            Self::Cancel(c) => &c.uid,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Call(_) => RequestKind::Call,
            Self::Cancel(_) => RequestKind::Cancel,
        }
    }
}

/// Timing attached to `success` responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Outbound envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEnvelope {
    Success {
        uid: OperationId,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stat: Option<Stat>,
    },
    Cancel {
        uid: OperationId,
    },
    /// `uid` is null when the offending frame had no readable uid.
    Error {
        uid: Option<OperationId>,
        data: ErrorInfo,
    },
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<OperationId>,
        data: Value,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Success,
    Cancel,
    Error,
    Notify,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Cancel => "cancel",
            Self::Error => "error",
            Self::Notify => "notify",
        }
    }
}

impl ResponseEnvelope {
    pub fn success(uid: OperationId, data: Value, stat: Option<Stat>) -> Self {
        Self::Success { uid, data, stat }
    }

    pub fn cancelled(uid: OperationId) -> Self {
        Self::Cancel { uid }
    }

    pub fn error(uid: Option<OperationId>, info: ErrorInfo) -> Self {
        Self::Error { uid, data: info }
    }

    pub fn notify(data: Value) -> Self {
        Self::Notify { uid: None, data }
    }

    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::Success { .. } => ResponseKind::Success,
            Self::Cancel { .. } => ResponseKind::Cancel,
            Self::Error { .. } => ResponseKind::Error,
            Self::Notify { .. } => ResponseKind::Notify,
        }
    }

    pub fn uid(&self) -> Option<&OperationId> {
        match self {
            Self::Success { uid, .. } | Self::Cancel { uid } => Some(uid),
            Self::Error { uid, .. } | Self::Notify { uid, .. } => uid.as_ref(),
        }
    }

    /// `success`, `cancel` and `error` end an operation; `notify` doesn't.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Notify { .. })
    }
}

/// An inbound frame that couldn't be turned into a [`RequestEnvelope`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed frame: {reason}")]
pub struct DecodeError {
    /// The frame's `uid` exactly as sent, if the frame parsed as JSON and
    /// carried one. Not necessarily a string.
    pub uid: Option<Value>,
    pub reason: String,
}

impl DecodeError {
    /// The `error` frame answering the bad request. The uid is echoed back
    /// verbatim, so a numeric uid stays numeric.
    pub fn to_frame(&self) -> String {
        let envelope = ResponseEnvelope::error(None, ErrorInfo::new(DECODE_ERROR, self.to_string()));
        let Some(uid) = &self.uid else {
            return encode(&envelope);
        };
        match serde_json::to_value(&envelope) {
            Ok(Value::Object(mut frame)) => {
                frame.insert("uid".into(), uid.clone());
                Value::Object(frame).to_string()
            }
            _ => encode(&envelope),
        }
    }
}

/// Decode a text frame into a request.
pub fn decode(raw: &str) -> Result<RequestEnvelope, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError {
        uid: None,
        reason: e.to_string(),
    })?;
    let uid = value.get("uid").filter(|uid| !uid.is_null()).cloned();
    serde_json::from_value(value).map_err(|e| DecodeError {
        uid,
        reason: e.to_string(),
    })
}

/// Encode a response into a text frame.
pub fn encode(envelope: &ResponseEnvelope) -> String {
    match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            // Only reachable if a payload holds something serde_json can't
            // represent; keep the frame well-formed regardless.
            tracing::error!(error = %e, kind = envelope.kind().as_str(), "Failed to encode envelope");
            let fallback = ResponseEnvelope::error(
                envelope.uid().cloned(),
                ErrorInfo::new(INTERNAL_ERROR, "failed to encode response"),
            );
            serde_json::to_string(&fallback).unwrap_or_else(|_| {
                r#"{"type":"error","uid":null,"data":{"code":"INTERNAL_ERROR","message":"failed to encode response"}}"#
                    .to_string()
            })
        }
    }
}
