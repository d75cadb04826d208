//! Gateway protocol definitions shared by every Gatelink client.
//!
//! This crate contains:
//! - Wire frame types for the JSON RPC protocol (`frames`)
//! - Device identity keys and the canonical auth payload (`crypto`)
//! - Error types (`error`)
//!
//! The crate is transport-agnostic: it never touches sockets. Clients pair it
//! with a WebSocket (or test) transport and drive the handshake themselves.

pub mod crypto;
pub mod error;
pub mod frames;

pub use crypto::{
    build_device_auth_payload, decode_key, derive_device_id, encode_key, verify_signature,
    DeviceAuthPayload, DeviceIdentity,
};
pub use error::{ProtocolError, Result};
pub use frames::{
    error_codes, roles, scopes, ChallengePayload, ClientInfo, ConnectAuth, ConnectParams,
    DeviceInfo, ErrorShape, EventFrame, Frame, HelloAuth, HelloOk, RequestFrame, ResponseFrame,
    ServerInfo, CHALLENGE_EVENT, CONNECT_METHOD, PROTOCOL_MAX, PROTOCOL_MIN,
};
