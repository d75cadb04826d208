//! Persistent device identity store.
//!
//! The identity is created once per install and reused for its lifetime. A
//! record that fails to parse or validate is replaced wholesale with a fresh
//! identity; a partially-usable record is never trusted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use protocol::crypto::{decode_key, encode_key, DeviceIdentity};
use protocol::error::Result;

use super::Storage;

/// Storage key of the persisted identity record.
pub const DEVICE_IDENTITY_KEY: &str = "device.identity";

const IDENTITY_RECORD_VERSION: u32 = 1;

/// Persisted identity record. Keys are base64url without padding.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    version: u32,
    public_key: String,
    private_key: String,
    created_at: u64,
}

/// Loads and persists the device identity through the storage capability.
#[derive(Clone)]
pub struct IdentityStore {
    storage: Arc<dyn Storage>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Returns the persisted identity, creating and persisting a new one if
    /// none exists or the stored record is malformed.
    ///
    /// Storage failures propagate: without persistence there is no stable
    /// identity to speak of.
    pub fn load_or_create(&self, now_ms: u64) -> Result<DeviceIdentity> {
        if let Some(text) = self.storage.get(DEVICE_IDENTITY_KEY)? {
            match parse_record(&text) {
                Ok(identity) => return Ok(identity),
                Err(reason) => {
                    warn!(reason, "replacing malformed device identity record");
                }
            }
        }
        let identity = DeviceIdentity::generate(now_ms);
        self.persist(&identity)?;
        info!(device_id = identity.device_id(), "created new device identity");
        Ok(identity)
    }

    fn persist(&self, identity: &DeviceIdentity) -> Result<()> {
        let record = IdentityRecord {
            version: IDENTITY_RECORD_VERSION,
            public_key: encode_key(&identity.public_key_bytes()),
            private_key: encode_key(&identity.secret_key_bytes()),
            created_at: identity.created_at_ms(),
        };
        let text = serde_json::to_string(&record)?;
        self.storage.set(DEVICE_IDENTITY_KEY, &text)
    }
}

/// Parses and validates a stored record. Any defect is a replacement reason,
/// not an error to surface.
fn parse_record(text: &str) -> std::result::Result<DeviceIdentity, &'static str> {
    let record: IdentityRecord = serde_json::from_str(text).map_err(|_| "unparseable json")?;
    if record.version != IDENTITY_RECORD_VERSION {
        return Err("unknown version tag");
    }
    let secret = decode_key(&record.private_key).map_err(|_| "undecodable private key")?;
    let secret: [u8; 32] = secret
        .as_slice()
        .try_into()
        .map_err(|_| "wrong private key length")?;
    let identity = DeviceIdentity::from_secret_key_bytes(&secret, record.created_at);
    let public = decode_key(&record.public_key).map_err(|_| "undecodable public key")?;
    if public != identity.public_key_bytes() {
        return Err("public key does not match private key");
    }
    Ok(identity)
}
