//! Gateway wire frame definitions.
//!
//! All traffic is JSON text frames over a message-oriented duplex transport.
//! Three frame kinds exist, discriminated by the `type` field:
//!
//! - `req`   — client → gateway RPC call
//! - `res`   — gateway → client RPC result, correlated by `id`
//! - `event` — gateway → client server-push
//!
//! The first frame the gateway sends on a fresh connection is always the
//! `connect.challenge` event; the client answers with a signed `connect`
//! request and receives a `hello-ok` payload on success.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowest protocol version this client can speak.
pub const PROTOCOL_MIN: u32 = 3;

/// Highest protocol version this client can speak.
pub const PROTOCOL_MAX: u32 = 5;

/// Event name of the handshake challenge pushed by the gateway.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Method name of the handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Well-known error codes reported by the gateway.
pub mod error_codes {
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
}

/// Connection roles understood by the gateway.
pub mod roles {
    /// Unattended device/automation identity.
    pub const NODE: &str = "node";
    /// Interactive human identity.
    pub const OPERATOR: &str = "operator";
}

/// Operator scopes this client requests.
pub mod scopes {
    pub const OPERATOR_READ: &str = "operator.read";
    pub const OPERATOR_WRITE: &str = "operator.write";
    pub const OPERATOR_TALK_SECRETS: &str = "operator.talk.secrets";
}

// ============================================================================
// Frames
// ============================================================================

/// Discriminated union of all wire frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Req(RequestFrame),
    #[serde(rename = "res")]
    Res(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, unique per connection for its lifetime.
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Error body carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl Frame {
    /// Serializes the frame to its JSON text form.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a frame from JSON text.
    pub fn from_json(text: &str) -> crate::Result<Frame> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Connect handshake
// ============================================================================

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengePayload {
    #[serde(default)]
    pub nonce: String,
    /// Gateway clock at challenge time; informational only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Parameters of the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    pub device: DeviceInfo,
}

/// Client identification block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Credentials offered at connect time. Omitted entirely when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectAuth {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.device_token.is_none() && self.password.is_none()
    }
}

/// Signed device identity block sent with `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device id, hex SHA-256 of the raw public key.
    pub id: String,
    /// Ed25519 public key, base64url without padding.
    pub public_key: String,
    /// Ed25519 signature over the canonical auth payload, base64url.
    pub signature: String,
    /// Client clock at signing time, Unix ms.
    pub signed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Payload of the successful `connect` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    #[serde(rename = "type", default)]
    pub payload_type: String,
    pub protocol: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Fresh device credentials issued by the gateway in `hello-ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub device_token: String,
}
