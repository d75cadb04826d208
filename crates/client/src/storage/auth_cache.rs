//! Cache of gateway-issued device tokens, keyed by (deviceId, role).
//!
//! Tokens are short-lived bearer credentials the gateway hands back in
//! `hello-ok`; caching them lets a reconnect skip interactive pairing. A
//! token the gateway has invalidated is cleared on the next failed connect.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use protocol::error::Result;

use super::Storage;

/// One cached device token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthEntry {
    pub token: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// When this entry was written, Unix ms.
    pub updated_at: u64,
}

/// Role-scoped device token cache over the storage capability.
///
/// Writes are last-writer-wins; at most one handshake per role is in flight
/// at a time, so no further coordination is needed.
#[derive(Clone)]
pub struct DeviceAuthCache {
    storage: Arc<dyn Storage>,
}

impl DeviceAuthCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(device_id: &str, role: &str) -> String {
        format!("device.auth/{device_id}/{role}")
    }

    /// Returns the cached entry, or `None` if absent or malformed.
    pub fn get(&self, device_id: &str, role: &str) -> Result<Option<DeviceAuthEntry>> {
        let Some(text) = self.storage.get(&Self::key(device_id, role))? else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                debug!(%err, device_id, role, "dropping malformed device auth entry");
                Ok(None)
            }
        }
    }

    /// Stores (or overwrites) the entry for (deviceId, role).
    pub fn put(&self, device_id: &str, entry: &DeviceAuthEntry) -> Result<()> {
        let text = serde_json::to_string(entry)?;
        self.storage.set(&Self::key(device_id, &entry.role), &text)
    }

    /// Removes the entry for (deviceId, role), if any.
    pub fn clear(&self, device_id: &str, role: &str) -> Result<()> {
        self.storage.remove(&Self::key(device_id, role))
    }
}
