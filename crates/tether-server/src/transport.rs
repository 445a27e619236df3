//! The socket seam. The connection loop only talks to a [`Transport`].

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};

use crate::error::TransportError;

/// One inbound event from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Binary payloads aren't part of the protocol; only the size is kept.
    Binary(usize),
    /// Ping or pong; counts as activity.
    Control,
    Closed,
    Error(TransportError),
}

#[async_trait]
pub trait Transport: Send {
    /// Next inbound frame. Must be cancel-safe: the connection loop races
    /// it against outbound traffic and timers.
    async fn read_frame(&mut self) -> Frame;

    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn ping(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// [`Transport`] over an upgraded axum WebSocket.
pub struct AxumTransport {
    socket: WebSocket,
    closed: bool,
}

impl AxumTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }

    fn fail(&mut self, e: &axum::Error) -> TransportError {
        self.closed = true;
        TransportError::Io {
            message: e.to_string(),
            fatal: true,
        }
    }
}

#[async_trait]
impl Transport for AxumTransport {
    async fn read_frame(&mut self) -> Frame {
        match self.socket.recv().await {
            Some(Ok(WsMessage::Text(text))) => Frame::Text(text.to_string()),
            Some(Ok(WsMessage::Binary(bytes))) => Frame::Binary(bytes.len()),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => Frame::Control,
            Some(Ok(WsMessage::Close(_))) | None => {
                self.closed = true;
                Frame::Closed
            }
            Some(Err(e)) => Frame::Error(self.fail(&e)),
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.socket.send(WsMessage::Text(text.into())).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(&e)),
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.socket.send(WsMessage::Ping(vec![].into())).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(&e)),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.socket.send(WsMessage::Close(None)).await;
            self.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
