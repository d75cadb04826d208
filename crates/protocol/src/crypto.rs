//! Device identity and authentication payload signing.
//!
//! Every install owns one long-lived Ed25519 keypair. The device id is
//! derived from the public key (hex SHA-256), so regenerating the identity
//! from the same keypair always yields the same id. The private key never
//! leaves this module except as bytes handed to the identity store.

use ed25519_dalek::{
    Signature, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Derives a device id from raw public key bytes.
///
/// The id is the lowercase hex SHA-256 digest of the 32 raw key bytes. This
/// is what the gateway recomputes server-side, so it must never change.
pub fn derive_device_id(public_key: &[u8; PUBLIC_KEY_LENGTH]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Encodes bytes as base64url without padding (the wire/at-rest key format).
pub fn encode_key(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes base64url key material, accepting standard base64 as a fallback.
pub fn decode_key(input: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    if let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.as_bytes()) {
        return Ok(bytes);
    }
    base64::engine::general_purpose::STANDARD
        .decode(input.as_bytes())
        .map_err(|e| ProtocolError::InvalidPublicKey(format!("bad key encoding: {e}")))
}

/// The identity of this device, including the secret key.
#[derive(Clone)]
pub struct DeviceIdentity {
    /// The Ed25519 signing key (secret key).
    signing_key: SigningKey,
    /// The Ed25519 verifying key (public key), derived from signing_key.
    verifying_key: VerifyingKey,
    /// The device identifier, derived from the public key.
    device_id: String,
    /// When this identity was first created, Unix ms.
    created_at_ms: u64,
}

impl DeviceIdentity {
    /// Generates a new random device identity.
    pub fn generate(created_at_ms: u64) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key, created_at_ms)
    }

    /// Restores a device identity from raw secret key bytes.
    ///
    /// The public key and device id are derived from the secret key.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH], created_at_ms: u64) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes), created_at_ms)
    }

    fn from_signing_key(signing_key: SigningKey, created_at_ms: u64) -> Self {
        let verifying_key = signing_key.verifying_key();
        let device_id = derive_device_id(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            device_id,
            created_at_ms,
        }
    }

    /// Returns the secret key bytes, for persistence only.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the public key in its wire encoding (base64url, no padding).
    pub fn public_key_encoded(&self) -> String {
        encode_key(&self.public_key_bytes())
    }

    /// Returns the stable device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns when this identity was created, Unix ms.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Signs a canonical auth payload, returning the base64url signature.
    pub fn sign(&self, payload: &str) -> String {
        let sig = self.signing_key.sign(payload.as_bytes());
        encode_key(&sig.to_bytes())
    }

    /// Verifies a base64url signature against a payload with this device's
    /// public key. Used by tests standing in for the gateway.
    pub fn verify(&self, payload: &str, signature: &str) -> Result<()> {
        verify_signature(&self.public_key_encoded(), payload, signature)
    }
}

/// Verifies a base64url signature against a payload given the signer's
/// encoded public key. This is the gateway-side check; the client exposes it
/// so test peers can validate what the client sends.
pub fn verify_signature(public_key: &str, payload: &str, signature: &str) -> Result<()> {
    let key_raw = decode_key(public_key)?;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_raw
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::InvalidPublicKey("bad public key length".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)?;
    let sig_raw = decode_key(signature)
        .map_err(|_| ProtocolError::InvalidSignature("bad signature encoding".to_string()))?;
    let sig_bytes: [u8; 64] = sig_raw
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::InvalidSignature("bad signature length".to_string()))?;
    key.verify_strict(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .map_err(ProtocolError::from)
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Fields bound into the signed connect request.
#[derive(Debug, Clone)]
pub struct DeviceAuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

/// Builds the canonical string the device signature covers.
///
/// Format: `v2|deviceId|clientId|clientMode|role|scopes|signedAt|token|nonce`
/// with scopes sorted and comma-joined and an absent token rendered as the
/// empty string. The `v1` form (no trailing nonce) exists only for gateways
/// that did not issue a challenge; this client always receives a nonce.
pub fn build_device_auth_payload(params: &DeviceAuthPayload<'_>) -> String {
    let version = if params.nonce.is_some() { "v2" } else { "v1" };
    let mut scopes = params.scopes.to_vec();
    scopes.sort();
    let mut parts = vec![
        version.to_string(),
        params.device_id.to_string(),
        params.client_id.to_string(),
        params.client_mode.to_string(),
        params.role.to_string(),
        scopes.join(","),
        params.signed_at_ms.to_string(),
        params.token.unwrap_or_default().to_string(),
    ];
    if let Some(nonce) = params.nonce {
        parts.push(nonce.to_string());
    }
    parts.join("|")
}
