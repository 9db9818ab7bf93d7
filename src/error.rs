/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/
use std::error::Error;
use std::fmt::{Display, Formatter};

/**
Errors that can occur while running a streaming session.

This enum covers configuration mistakes, endpoint resolution failures, token
endpoint rejections, transport failures on the WebSocket, malformed frames and
misuse of the session or subscription registries.
*/
#[derive(Debug)]
pub enum StreamingError {
    /// Invalid or incomplete configuration, such as an unknown connection name.
    Config(String),
    /// Endpoint resolution produced no usable WebSocket endpoint.
    Resolution(String),
    /// The discovery endpoint answered with a non-success status.
    Discovery {
        /// HTTP status returned by the discovery endpoint.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// The token endpoint or the streaming server rejected the credentials.
    Authentication {
        /// HTTP status code when the rejection came from the token endpoint.
        status: Option<u16>,
        /// Server supplied description.
        message: String,
    },
    /// Network level failure while talking to an HTTP endpoint.
    Http(reqwest::Error),
    /// Error originating from the underlying WebSocket connection.
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    /// JSON serialization or deserialization failure.
    Serialization(serde_json::Error),
    /// Failure to establish or keep a streaming connection.
    Connection(String),
    /// A frame violated the expected wire protocol.
    Protocol(String),
    /// Subscription or session registry misuse.
    Registry(String),
    /// Operation not allowed in the current session state.
    Session(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// The object was closed while the operation was in progress.
    Closed(String),
}

impl StreamingError {
    /// Returns `true` when the error is an HTTP 4xx rejection from the token endpoint.
    pub fn is_client_rejection(&self) -> bool {
        matches!(
            self,
            StreamingError::Authentication {
                status: Some(code),
                ..
            } if (400..500).contains(code)
        )
    }

    /// Returns `true` for network level failures that are worth retrying.
    pub fn is_network(&self) -> bool {
        matches!(self, StreamingError::Http(_))
    }
}

impl Display for StreamingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::Config(e) => write!(f, "Configuration error: {}", e),
            StreamingError::Resolution(e) => write!(f, "Resolution error: {}", e),
            StreamingError::Discovery { status, body } => {
                write!(f, "Discovery error: status {} - {}", status, body)
            }
            StreamingError::Authentication {
                status: Some(status),
                message,
            } => write!(f, "Authentication error: status {} - {}", status, message),
            StreamingError::Authentication {
                status: None,
                message,
            } => write!(f, "Authentication error: {}", message),
            StreamingError::Http(e) => write!(f, "HTTP error: {}", e),
            StreamingError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            StreamingError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StreamingError::Connection(e) => write!(f, "Connection error: {}", e),
            StreamingError::Protocol(e) => write!(f, "Protocol error: {}", e),
            StreamingError::Registry(e) => write!(f, "Registry error: {}", e),
            StreamingError::Session(e) => write!(f, "Session error: {}", e),
            StreamingError::Timeout(e) => write!(f, "Timeout error: {}", e),
            StreamingError::Closed(e) => write!(f, "Closed: {}", e),
        }
    }
}

impl Error for StreamingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamingError::Http(e) => Some(e),
            StreamingError::WebSocket(e) => Some(e.as_ref()),
            StreamingError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamingError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamingError::WebSocket(Box::new(e))
    }
}

impl From<serde_json::Error> for StreamingError {
    fn from(e: serde_json::Error) -> Self {
        StreamingError::Serialization(e)
    }
}

impl From<reqwest::Error> for StreamingError {
    fn from(e: reqwest::Error) -> Self {
        StreamingError::Http(e)
    }
}

impl From<url::ParseError> for StreamingError {
    fn from(e: url::ParseError) -> Self {
        StreamingError::Config(format!("invalid URL: {}", e))
    }
}

/// A type alias for `Result<T, StreamingError>`.
///
/// # Example
///
/// ```rust
/// use rdplink::error::StreamingResult;
///
/// fn example_function() -> StreamingResult<String> {
///     Ok("Success!".to_string())
/// }
/// ```
pub type StreamingResult<T> = Result<T, StreamingError>;
