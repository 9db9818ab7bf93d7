/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::config::{DacsParams, Protocol};
use crate::error::{StreamingError, StreamingResult};
use crate::messages::{
    OmmCloseMessage, OmmHeartbeatMessage, OmmItemKey, OmmLoginElements, OmmLoginKey,
    OmmLoginMessage, OmmState, OmmStatusMessage, RdpAuthMessage, RdpCloseMessage, RdpState,
    RdpStatusMessage,
};
use serde_json::Value;

/// Logs in with a bearer token (platform connections).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLogin {
    pub application_id: String,
    pub position: String,
}

/// Logs in with a DACS user name (deployed connections).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedLogin {
    pub dacs: DacsParams,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Login(LoginResponse),
    Refresh { id: u64, complete: bool },
    Update { id: u64 },
    Status { id: u64 },
    Error { id: Option<u64> },
    Ack { id: u64 },
    Ping,
    Pong,
    Unsupported(String),
}

/// Outcome of a login request as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginResponse {
    pub accepted: bool,
    /// `true` for the answer to a login request, `false` for unsolicited login status.
    pub refresh: bool,
    pub text: String,
    pub ping_timeout: Option<u64>,
    pub max_message_size: Option<u64>,
}

/// Builds connection level frames and classifies inbound ones for one connection.
///
/// Which login is sent depends on the login components present: a token login is
/// used whenever a token is available, the deployed login otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCodec {
    protocol: Protocol,
    token_login: Option<TokenLogin>,
    deployed_login: Option<DeployedLogin>,
}

impl ProtocolCodec {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            token_login: None,
            deployed_login: None,
        }
    }

    pub fn with_token_login(mut self, login: TokenLogin) -> Self {
        self.token_login = Some(login);
        self
    }

    pub fn with_deployed_login(mut self, login: DeployedLogin) -> Self {
        self.deployed_login = Some(login);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn sub_protocol(&self) -> &'static str {
        self.protocol.sub_protocol()
    }

    /// Token logins can be retried with a fresh token; deployed logins cannot.
    pub fn uses_token(&self) -> bool {
        self.token_login.is_some()
    }

    /// Login request for the login stream `id`. Also used for re-authentication.
    ///
    /// # Errors
    ///
    /// `StreamingError::Authentication` when neither a token nor a deployed login is
    /// available for this connection.
    pub fn login_frame(&self, id: u64, token: Option<&str>) -> StreamingResult<Value> {
        match (self.protocol, &self.token_login, token, &self.deployed_login) {
            (Protocol::Omm, Some(login), Some(token), _) => Ok(serde_json::to_value(OmmLoginMessage {
                id,
                domain: "Login".to_string(),
                key: OmmLoginKey {
                    name: None,
                    name_type: Some("AuthnToken".to_string()),
                    elements: OmmLoginElements {
                        application_id: login.application_id.clone(),
                        position: login.position.clone(),
                        authentication_token: Some(token.to_string()),
                    },
                },
            })?),
            (Protocol::Omm, _, _, Some(deployed)) => Ok(serde_json::to_value(OmmLoginMessage {
                id,
                domain: "Login".to_string(),
                key: OmmLoginKey {
                    name: Some(deployed.dacs.username.clone()),
                    name_type: None,
                    elements: OmmLoginElements {
                        application_id: deployed.dacs.application_id.clone(),
                        position: deployed.dacs.position.clone(),
                        authentication_token: None,
                    },
                },
            })?),
            (Protocol::Rdp, Some(_), Some(token), _) => Ok(serde_json::to_value(RdpAuthMessage {
                stream_id: id.to_string(),
                method: "Auth".to_string(),
                token: token.to_string(),
            })?),
            _ => Err(StreamingError::Authentication {
                status: None,
                message: format!("no {} login credentials available", self.protocol),
            }),
        }
    }

    /// Closes the login stream `id`.
    pub fn logout_frame(&self, id: u64) -> StreamingResult<Value> {
        match self.protocol {
            Protocol::Omm => Ok(serde_json::to_value(OmmCloseMessage {
                id,
                domain: Some("Login".to_string()),
                message_type: "Close".to_string(),
            })?),
            Protocol::Rdp => Ok(serde_json::to_value(RdpCloseMessage {
                stream_id: id.to_string(),
                method: "Close".to_string(),
            })?),
        }
    }

    /// Application level ping. RDP relies on WebSocket control frames instead.
    pub fn ping_frame(&self) -> Option<Value> {
        self.heartbeat("Ping")
    }

    pub fn pong_frame(&self) -> Option<Value> {
        self.heartbeat("Pong")
    }

    fn heartbeat(&self, message_type: &str) -> Option<Value> {
        match self.protocol {
            Protocol::Omm => serde_json::to_value(OmmHeartbeatMessage {
                message_type: message_type.to_string(),
            })
            .ok(),
            Protocol::Rdp => None,
        }
    }

    /// Status frame sent locally to a stream to report a connection level condition.
    pub fn status_frame(
        &self,
        id: u64,
        name: &str,
        stream_state: &str,
        data_state: &str,
        code: &str,
        text: &str,
    ) -> StreamingResult<Value> {
        match self.protocol {
            Protocol::Omm => Ok(serde_json::to_value(OmmStatusMessage {
                id,
                message_type: "Status".to_string(),
                key: OmmItemKey {
                    name: name.to_string(),
                    service: None,
                },
                state: OmmState {
                    stream: stream_state.to_string(),
                    data: data_state.to_string(),
                    code: Some(code.to_string()),
                    text: Some(text.to_string()),
                },
            })?),
            Protocol::Rdp => Ok(serde_json::to_value(RdpStatusMessage {
                stream_id: id.to_string(),
                message_type: "Status".to_string(),
                state: RdpState {
                    stream: stream_state.to_string(),
                    data: data_state.to_string(),
                    code: code.to_string(),
                    message: text.to_string(),
                },
            })?),
        }
    }

    /// Classifies one inbound frame. `login_id` is the id of the login stream, if any.
    pub fn classify(&self, frame: &Value, login_id: Option<u64>) -> InboundFrame {
        match self.protocol {
            Protocol::Omm => classify_omm(frame, login_id),
            Protocol::Rdp => classify_rdp(frame, login_id),
        }
    }
}

fn classify_omm(frame: &Value, login_id: Option<u64>) -> InboundFrame {
    let message_type = frame.get("Type").and_then(Value::as_str);
    let id = frame.get("ID").and_then(Value::as_u64);
    let is_login = frame.get("Domain").and_then(Value::as_str) == Some("Login")
        || (id.is_some() && id == login_id);

    match (message_type, id) {
        (Some("Ping"), _) => InboundFrame::Ping,
        (Some("Pong"), _) => InboundFrame::Pong,
        (Some(kind @ ("Refresh" | "Status")), _) if is_login => {
            let state = frame.get("State");
            let field = |name: &str| {
                state
                    .and_then(|s| s.get(name))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
            };
            let elements = frame.get("Elements");
            InboundFrame::Login(LoginResponse {
                accepted: field("Stream") == "Open" && field("Data") == "Ok",
                refresh: kind == "Refresh",
                text: field("Text").to_string(),
                ping_timeout: elements
                    .and_then(|e| e.get("PingTimeout"))
                    .and_then(Value::as_u64),
                max_message_size: elements
                    .and_then(|e| e.get("MaxMsgSize"))
                    .and_then(Value::as_u64),
            })
        }
        (Some("Refresh"), Some(id)) => InboundFrame::Refresh {
            id,
            complete: frame
                .get("Complete")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        },
        (Some("Update"), Some(id)) => InboundFrame::Update { id },
        (Some("Status"), Some(id)) => InboundFrame::Status { id },
        (Some("Error"), id) => InboundFrame::Error { id },
        (Some(kind), _) => InboundFrame::Unsupported(kind.to_string()),
        (None, _) => InboundFrame::Unsupported("<no type>".to_string()),
    }
}

fn classify_rdp(frame: &Value, login_id: Option<u64>) -> InboundFrame {
    let message_type = frame.get("type").and_then(Value::as_str);
    let id = match frame.get("streamID") {
        Some(Value::String(id)) => id.parse::<u64>().ok(),
        Some(Value::Number(id)) => id.as_u64(),
        _ => None,
    };

    if id.is_some() && id == login_id {
        let state = frame.get("state");
        let text = state
            .and_then(|s| s.get("text").or_else(|| s.get("message")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let code = state
            .and_then(|s| s.get("code"))
            .and_then(Value::as_u64)
            .unwrap_or(200);
        return match message_type {
            Some("Ack") => InboundFrame::Login(LoginResponse {
                accepted: code < 400,
                refresh: true,
                text,
                ..LoginResponse::default()
            }),
            Some("Alarm" | "Error") => InboundFrame::Login(LoginResponse {
                accepted: false,
                refresh: true,
                text,
                ..LoginResponse::default()
            }),
            Some(kind) => InboundFrame::Unsupported(kind.to_string()),
            None => InboundFrame::Unsupported("<no type>".to_string()),
        };
    }

    match (message_type, id) {
        (Some("Response"), Some(id)) => InboundFrame::Refresh { id, complete: true },
        (Some("Update"), Some(id)) => InboundFrame::Update { id },
        (Some("Status"), Some(id)) => InboundFrame::Status { id },
        (Some("Ack"), Some(id)) => InboundFrame::Ack { id },
        (Some("Alarm" | "Error"), id) => InboundFrame::Error { id },
        (Some("Ping"), _) => InboundFrame::Ping,
        (Some("Pong"), _) => InboundFrame::Pong,
        (Some(kind), _) => InboundFrame::Unsupported(kind.to_string()),
        (None, _) => InboundFrame::Unsupported("<no type>".to_string()),
    }
}

/// Splits a text message into frames. Servers send JSON arrays; a single object is accepted too.
pub fn split_frames(text: &str) -> StreamingResult<Vec<Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(frames) => Ok(frames),
        frame @ Value::Object(_) => Ok(vec![frame]),
        other => Err(StreamingError::Protocol(format!(
            "expected a JSON array of frames, got {}",
            other
        ))),
    }
}

/// Value of the stream state carried by a status frame of either protocol.
pub fn stream_state_of(frame: &Value) -> Option<&str> {
    frame
        .get("State")
        .and_then(|s| s.get("Stream"))
        .or_else(|| frame.get("state").and_then(|s| s.get("stream")))
        .and_then(Value::as_str)
}
