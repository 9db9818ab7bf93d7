/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use serde::{Deserialize, Serialize};
use serde_json::Value;

// OMM LOGIN
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmLoginMessage {
    #[serde(rename = "ID")]
    pub id: u64,
    pub domain: String,
    pub key: OmmLoginKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmLoginKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_type: Option<String>,
    pub elements: OmmLoginElements,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmLoginElements {
    pub application_id: String,
    pub position: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<String>,
}

// OMM ITEM REQUEST
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmRequestMessage {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub key: OmmItemKey,
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmItemKey {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

// OMM CLOSE
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmCloseMessage {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "Type")]
    pub message_type: String,
}

// OMM PING / PONG
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OmmHeartbeatMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
}

// OMM SYNTHETIC STATUS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmStatusMessage {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Type")]
    pub message_type: String,
    pub key: OmmItemKey,
    pub state: OmmState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OmmState {
    pub stream: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// RDP AUTH
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RdpAuthMessage {
    #[serde(rename = "streamID")]
    pub stream_id: String,
    pub method: String,
    pub token: String,
}

// RDP SUBSCRIBE
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RdpSubscribeMessage {
    #[serde(rename = "streamID")]
    pub stream_id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub universe: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub views: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

// RDP CLOSE
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RdpCloseMessage {
    #[serde(rename = "streamID")]
    pub stream_id: String,
    pub method: String,
}

// RDP SYNTHETIC STATUS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RdpStatusMessage {
    #[serde(rename = "streamID")]
    pub stream_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub state: RdpState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RdpState {
    pub stream: String,
    pub data: String,
    pub code: String,
    pub message: String,
}
