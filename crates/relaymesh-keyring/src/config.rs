//! Keyring configuration loaded from environment variables and config files.
//!
//! Config precedence: env vars > .env file > config.toml > defaults.
//!
//! ```toml
//! server_name = "relaymesh.example.com"
//! federation_port = 8448
//! request_timeout_secs = 30
//!
//! [[trusted_key_servers]]
//! server_name = "notary.example.com"
//! verify_keys = { "ed25519:auto" = "<unpadded-base64-public-key>" }
//! ```

use std::collections::HashMap;

use serde::Deserialize;

use crate::{
    client::DEFAULT_FEDERATION_PORT,
    error::KeyringError,
    keys::{ED25519, VerifyKey, parse_key_id},
};

#[derive(Debug, Deserialize, Clone)]
pub struct KeyringConfig {
    /// Public name of this server (e.g. "relaymesh.example.com").
    pub server_name: String,
    /// Port remote servers listen on for federation traffic.
    pub federation_port: u16,
    /// Timeout for outbound key-fetch requests.
    pub request_timeout_secs: u64,
    /// Notary servers trusted to vouch for other servers' keys, tried in
    /// the order listed.
    pub trusted_key_servers: Vec<TrustedKeyServerConfig>,
}

/// A trusted notary and its pre-configured verify keys.
///
/// Notary keys are static configuration; they are never fetched over the
/// network.
#[derive(Debug, Deserialize, Clone)]
pub struct TrustedKeyServerConfig {
    pub server_name: String,
    /// Key id → unpadded-base64 Ed25519 public key.
    pub verify_keys: HashMap<String, String>,
}

impl KeyringConfig {
    /// Load configuration from the environment.
    ///
    /// Reads an optional `.env` file, an optional `config.toml`, and
    /// `RELAYMESH__`-prefixed environment variables
    /// (e.g. `RELAYMESH__SERVER_NAME`).
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let cfg = config::Config::builder()
            .set_default("server_name", "localhost")?
            .set_default("federation_port", DEFAULT_FEDERATION_PORT)?
            .set_default("request_timeout_secs", 30)?
            .set_default("trusted_key_servers", Vec::<String>::new())?
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("RELAYMESH").separator("__").try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

impl TrustedKeyServerConfig {
    /// Decode the configured verify keys into usable key material.
    /// Fails on the first malformed entry.
    pub fn parsed_verify_keys(&self) -> Result<HashMap<String, VerifyKey>, KeyringError> {
        let mut keys = HashMap::new();
        for (key_id, key_base64) in &self.verify_keys {
            let (algorithm, version) = parse_key_id(key_id)?;
            if algorithm != ED25519 {
                return Err(KeyringError::BadKeyMaterial(format!(
                    "unsupported algorithm in trusted key id '{key_id}'"
                )));
            }
            keys.insert(key_id.clone(), VerifyKey::from_base64(version, key_base64)?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKeyPair;

    #[test]
    fn parses_configured_notary_keys() {
        let kp = SigningKeyPair::generate_with_version("auto");
        let cfg = TrustedKeyServerConfig {
            server_name: "notary.example.com".into(),
            verify_keys: HashMap::from([(kp.key_id.clone(), kp.verify_key().to_base64())]),
        };

        let keys = cfg.parsed_verify_keys().unwrap();
        assert_eq!(keys[&kp.key_id], kp.verify_key());
    }

    #[test]
    fn rejects_unsupported_algorithm() {
        let cfg = TrustedKeyServerConfig {
            server_name: "notary.example.com".into(),
            verify_keys: HashMap::from([("rsa:1".to_owned(), "AAAA".to_owned())]),
        };
        assert!(matches!(
            cfg.parsed_verify_keys(),
            Err(KeyringError::BadKeyMaterial(_))
        ));
    }

    #[test]
    fn rejects_garbage_key_material() {
        let cfg = TrustedKeyServerConfig {
            server_name: "notary.example.com".into(),
            verify_keys: HashMap::from([("ed25519:1".to_owned(), "not base64!!".to_owned())]),
        };
        assert!(cfg.parsed_verify_keys().is_err());
    }
}
