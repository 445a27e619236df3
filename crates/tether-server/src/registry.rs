use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tether_core::{ResponseEnvelope, SessionId};
use tokio::sync::mpsc;

use crate::session::ConnectionSession;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error("send queue full for session {0}")]
    QueueFull(SessionId),
}

/// Process-wide table of open connections, keyed by session id. Lets code
/// outside a connection push `notify` envelopes to it.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, Arc<ConnectionSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ConnectionSession>) {
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn unregister(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ConnectionSession>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Queue an unsolicited `notify` for one session. Never waits: a full
    /// queue drops the message.
    pub fn push(&self, id: &SessionId, payload: Value) -> Result<(), PushError> {
        let Some(session) = self.get(id) else {
            return Err(PushError::NotConnected(id.clone()));
        };
        match session.outbound().try_send(ResponseEnvelope::notify(payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %id, "Send queue full, dropping notify");
                Err(PushError::QueueFull(id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::NotConnected(id.clone())),
        }
    }

    /// Push to every open session; returns how many accepted it.
    pub fn broadcast(&self, payload: &Value) -> usize {
        self.session_ids()
            .iter()
            .filter(|id| self.push(id, payload.clone()).is_ok())
            .count()
    }

    /// Ask one connection to shut down.
    pub fn close(&self, id: &SessionId) -> bool {
        match self.get(id) {
            Some(session) => {
                session.shutdown_token().cancel();
                true
            }
            None => false,
        }
    }

    /// Shut down sessions with no inbound traffic for `timeout`.
    pub fn close_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Arc<ConnectionSession>> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() >= timeout)
            .map(|e| Arc::clone(e.value()))
            .collect();

        for session in &idle {
            tracing::info!(session_id = %session.id(), idle_secs = session.idle_for().as_secs(), "Closing idle connection");
            session.shutdown_token().cancel();
        }
        idle.len()
    }
}

/// Periodically close idle connections.
pub fn start_idle_reaper(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let closed = registry.close_idle(timeout);
            if closed > 0 {
                tracing::info!(closed = closed, "Idle connection cleanup");
            }
        }
    })
}
