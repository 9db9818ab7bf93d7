/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes reported through the session `on_event` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCode {
    StreamConnecting,
    StreamConnected,
    StreamDisconnected,
    StreamAuthenticationSuccess,
    StreamAuthenticationFailed,
    StreamReconnecting,
    SessionConnecting,
    SessionConnected,
    SessionDisconnected,
    SessionAuthenticationSuccess,
    SessionAuthenticationFailed,
    SessionReconnecting,
    DataRequestOk,
    DataRequestFailed,
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventCode::StreamConnecting => write!(f, "StreamConnecting"),
            EventCode::StreamConnected => write!(f, "StreamConnected"),
            EventCode::StreamDisconnected => write!(f, "StreamDisconnected"),
            EventCode::StreamAuthenticationSuccess => write!(f, "StreamAuthenticationSuccess"),
            EventCode::StreamAuthenticationFailed => write!(f, "StreamAuthenticationFailed"),
            EventCode::StreamReconnecting => write!(f, "StreamReconnecting"),
            EventCode::SessionConnecting => write!(f, "SessionConnecting"),
            EventCode::SessionConnected => write!(f, "SessionConnected"),
            EventCode::SessionDisconnected => write!(f, "SessionDisconnected"),
            EventCode::SessionAuthenticationSuccess => write!(f, "SessionAuthenticationSuccess"),
            EventCode::SessionAuthenticationFailed => write!(f, "SessionAuthenticationFailed"),
            EventCode::SessionReconnecting => write!(f, "SessionReconnecting"),
            EventCode::DataRequestOk => write!(f, "DataRequestOk"),
            EventCode::DataRequestFailed => write!(f, "DataRequestFailed"),
        }
    }
}

impl EventCode {
    /// Event codes raised by a streaming connection rather than by the session itself.
    pub fn is_stream_event(&self) -> bool {
        matches!(
            self,
            EventCode::StreamConnecting
                | EventCode::StreamConnected
                | EventCode::StreamDisconnected
                | EventCode::StreamAuthenticationSuccess
                | EventCode::StreamAuthenticationFailed
                | EventCode::StreamReconnecting
        )
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Closed,
    Pending,
    Open,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "Closed"),
            SessionState::Pending => write!(f, "Pending"),
            SessionState::Open => write!(f, "Open"),
        }
    }
}

/// Lifecycle of a single streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Pending,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Pending => write!(f, "Pending"),
            ConnectionState::Open => write!(f, "Open"),
        }
    }
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Closed,
    Pending,
    Open,
    Paused,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamState::Closed => write!(f, "Closed"),
            StreamState::Pending => write!(f, "Pending"),
            StreamState::Open => write!(f, "Open"),
            StreamState::Paused => write!(f, "Paused"),
        }
    }
}

/// Progress of a reconnection sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverState {
    Started,
    Completed,
    Error,
}

impl FailoverState {
    /// Value placed in the `Code` field of the synthetic status frame sent to streams.
    pub fn status_code(&self) -> &'static str {
        match self {
            FailoverState::Started => "FailoverStarted",
            FailoverState::Completed => "FailoverCompleted",
            FailoverState::Error => "Error",
        }
    }
}

/// A status notification delivered to the session `on_event` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub code: EventCode,
    pub message: String,
    /// Logical connection name for events raised by a streaming connection.
    pub connection_name: Option<String>,
    /// Streaming session id of the connection that raised the event.
    pub streaming_session_id: Option<u64>,
}

impl SessionEvent {
    pub fn session(code: EventCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            connection_name: None,
            streaming_session_id: None,
        }
    }

    pub fn stream(
        code: EventCode,
        message: impl Into<String>,
        connection_name: &str,
        streaming_session_id: u64,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            connection_name: Some(connection_name.to_string()),
            streaming_session_id: Some(streaming_session_id),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.connection_name {
            Some(name) => write!(f, "[{}] {}: {}", name, self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}
