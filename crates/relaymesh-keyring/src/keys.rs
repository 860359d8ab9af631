//! Ed25519 signing-key primitives.
//!
//! Every federation server holds one or more Ed25519 key pairs used to sign
//! outbound events and its own key document. Remote servers verify those
//! signatures with the public key published at `/_matrix/key/v2/server`.
//!
//! # Key IDs
//! Key IDs follow the Matrix convention: `<algorithm>:<version>`, e.g.
//! `ed25519:a1b2c3`. Only the `ed25519` algorithm is supported; key ids with
//! an unknown algorithm are ignored wherever they appear.

use std::collections::HashMap;

use base64::Engine as _;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeyringError;

/// The only signature algorithm the keyring understands.
pub const ED25519: &str = "ed25519";

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
}

// ─── Key ids ─────────────────────────────────────────────────────────────────

/// Split a `<algorithm>:<version>` key id into its parts.
pub fn parse_key_id(key_id: &str) -> Result<(&str, &str), KeyringError> {
    key_id
        .split_once(':')
        .filter(|(alg, ver)| !alg.is_empty() && !ver.is_empty())
        .ok_or_else(|| KeyringError::MalformedKeyId(key_id.to_owned()))
}

/// Whether a key id names an algorithm this keyring can verify.
pub fn is_supported_key_id(key_id: &str) -> bool {
    matches!(parse_key_id(key_id), Ok((ED25519, _)))
}

// ─── Public verify keys ──────────────────────────────────────────────────────

/// A remote server's public verify key, together with its key version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyKey {
    /// The `<version>` half of the key id.
    pub version: String,
    key: VerifyingKey,
}

impl VerifyKey {
    /// Decode a verify key from its unpadded-base64 wire form.
    pub fn from_base64(version: impl Into<String>, key_base64: &str) -> Result<Self, KeyringError> {
        let bytes = b64()
            .decode(key_base64)
            .map_err(|e| KeyringError::BadKeyMaterial(format!("invalid base64: {e}")))?;
        let key = VerifyingKey::from_bytes(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyringError::BadKeyMaterial("key must be 32 bytes".into()))?,
        )
        .map_err(|e| KeyringError::BadKeyMaterial(e.to_string()))?;
        Ok(Self { version: version.into(), key })
    }

    /// The full `ed25519:<version>` key id.
    pub fn key_id(&self) -> String {
        format!("{}:{}", ED25519, self.version)
    }

    /// Unpadded-base64 encoding of the public key bytes.
    pub fn to_base64(&self) -> String {
        b64().encode(self.key.as_bytes())
    }

    /// Verify an unpadded-base64 signature over `message`.
    ///
    /// A malformed signature fails the same way a mismatched one does; the
    /// caller decides what server context to attach.
    pub fn verify(&self, message: &[u8], sig_base64: &str) -> Result<(), SignatureMismatch> {
        let sig_bytes = b64().decode(sig_base64).map_err(|_| SignatureMismatch)?;
        let signature = ed25519_dalek::Signature::from_bytes(
            sig_bytes.as_slice().try_into().map_err(|_| SignatureMismatch)?,
        );
        self.key.verify(message, &signature).map_err(|_| SignatureMismatch)
    }
}

/// Context-free signature failure returned by [`VerifyKey::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("signature verification failed")]
pub struct SignatureMismatch;

// ─── Key pair ────────────────────────────────────────────────────────────────

/// An Ed25519 signing key pair.
///
/// The version is baked into the key id at construction time and never
/// changes for the lifetime of the pair.
pub struct SigningKeyPair {
    /// Key ID in the format `ed25519:<version>`.
    pub key_id: String,
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Generate a brand-new random key pair. The key version is a short hex
    /// fingerprint of the public key.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let version = hex::encode(&signing_key.verifying_key().as_bytes()[..6]);
        Self { key_id: format!("{ED25519}:{version}"), signing_key }
    }

    /// Generate a random key pair with an explicit key version.
    pub fn generate_with_version(version: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { key_id: format!("{ED25519}:{version}"), signing_key }
    }

    /// Reconstruct a pair from raw 32-byte seed bytes (as persisted).
    pub fn from_seed(version: &str, seed: &[u8]) -> Result<Self, KeyringError> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| KeyringError::BadKeyMaterial("seed must be exactly 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        Ok(Self { key_id: format!("{ED25519}:{version}"), signing_key })
    }

    /// Return the 32-byte seed (private key scalar) for persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Return the public half as a [`VerifyKey`].
    pub fn verify_key(&self) -> VerifyKey {
        let (_, version) = self.key_id.split_once(':').expect("key_id is well-formed");
        VerifyKey { version: version.to_owned(), key: self.signing_key.verifying_key() }
    }

    /// Sign arbitrary bytes and return the unpadded-base64 signature.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        let sig = self.signing_key.sign(bytes);
        b64().encode(sig.to_bytes())
    }

    /// Build this server's signed key document for `/_matrix/key/v2/server`.
    pub fn to_key_document(&self, server_name: &str, valid_until_ts: i64) -> ServerKeyDocument {
        let mut verify_keys = HashMap::new();
        verify_keys
            .insert(self.key_id.clone(), VerifyKeyEntry { key: self.verify_key().to_base64() });
        ServerKeyDocument {
            server_name: server_name.to_owned(),
            verify_keys,
            old_verify_keys: HashMap::new(),
            valid_until_ts,
            signatures: HashMap::new(),
        }
    }

    /// Build and self-sign this server's key document, ready to serve at
    /// `/_matrix/key/v2/server`.
    pub fn signed_key_document(
        &self,
        server_name: &str,
        valid_until_ts: i64,
    ) -> Result<Value, KeyringError> {
        let mut doc = serde_json::to_value(self.to_key_document(server_name, valid_until_ts))?;
        crate::signed_json::sign_json(self, server_name, &mut doc)?;
        Ok(doc)
    }
}

// ─── Key document (wire format) ───────────────────────────────────────────────

/// The signed key document served at `/_matrix/key/v2/server` and relayed by
/// notary servers from `/_matrix/key/v2/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerKeyDocument {
    pub server_name: String,
    /// Current verify keys, keyed by key id.
    pub verify_keys: HashMap<String, VerifyKeyEntry>,
    /// Expired keys the server once used. Parsed for wire fidelity; never
    /// yields a usable verify key.
    #[serde(default)]
    pub old_verify_keys: HashMap<String, OldVerifyKeyEntry>,
    /// Unix millisecond timestamp after which this document must be re-fetched.
    pub valid_until_ts: i64,
    /// `signatures.<server_name>.<key_id>` → unpadded-base64 signature.
    #[serde(default)]
    pub signatures: HashMap<String, HashMap<String, String>>,
}

/// A single public verify key entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyKeyEntry {
    /// Unpadded-base64 Ed25519 public key bytes.
    pub key: String,
}

/// A retired verify key entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OldVerifyKeyEntry {
    pub key: String,
    pub expired_ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_sign_verify() {
        let kp = SigningKeyPair::generate();
        let msg = b"hello relaymesh federation";
        let sig = kp.sign_bytes(msg);
        kp.verify_key().verify(msg, &sig).expect("signature should verify");
    }

    #[test]
    fn from_seed_is_stable() {
        let kp1 = SigningKeyPair::generate_with_version("1");
        let seed = kp1.seed_bytes();
        let kp2 = SigningKeyPair::from_seed("1", &seed).unwrap();
        assert_eq!(kp1.key_id, kp2.key_id);
        assert_eq!(kp1.verify_key().to_base64(), kp2.verify_key().to_base64());
    }

    #[test]
    fn verify_key_base64_round_trip() {
        let kp = SigningKeyPair::generate_with_version("ver1");
        let vk = VerifyKey::from_base64("ver1", &kp.verify_key().to_base64()).unwrap();
        assert_eq!(vk, kp.verify_key());
        assert_eq!(vk.key_id(), "ed25519:ver1");
    }

    #[test]
    fn key_id_parsing() {
        assert_eq!(parse_key_id("ed25519:abc").unwrap(), ("ed25519", "abc"));
        assert!(parse_key_id("ed25519").is_err());
        assert!(parse_key_id(":abc").is_err());
        assert!(is_supported_key_id("ed25519:1"));
        assert!(!is_supported_key_id("rsa:1"));
    }

    #[test]
    fn signed_key_document_verifies_with_its_own_key() {
        let kp = SigningKeyPair::generate_with_version("a1");
        let doc = kp.signed_key_document("origin.example.com", 5000).unwrap();
        crate::signed_json::verify_signed_json(&doc, "origin.example.com", &kp.verify_key())
            .unwrap();
        assert_eq!(doc["valid_until_ts"], 5000);
        assert!(doc["verify_keys"]["ed25519:a1"].is_object());
    }

    #[test]
    fn rejects_wrong_signature() {
        let kp = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let sig = other.sign_bytes(b"message");
        assert!(kp.verify_key().verify(b"message", &sig).is_err());
    }
}
