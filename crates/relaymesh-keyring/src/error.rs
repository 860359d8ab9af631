//! Keyring-specific error types.

use thiserror::Error;

/// Errors that can occur while verifying signed objects or fetching keys.
#[derive(Debug, Error)]
pub enum KeyringError {
    // ── Verification failures surfaced to callers ───────────────────────────

    #[error("Object is not signed by '{server_name}'")]
    NotSigned { server_name: String },

    #[error("No verify key for server '{server_name}' with key ids {key_ids}")]
    NoVerifyKey { server_name: String, key_ids: String },

    #[error(
        "Key '{key_id}' for server '{server_name}' is only valid until {valid_until_ts} \
         but validity until {minimum_valid_until_ts} was required"
    )]
    StaleVerifyKey {
        server_name: String,
        key_id: String,
        valid_until_ts: i64,
        minimum_valid_until_ts: i64,
    },

    #[error("Invalid signature for server '{server_name}' with key '{key_id}'")]
    InvalidSignature { server_name: String, key_id: String },

    // ── Key material ────────────────────────────────────────────────────────

    #[error("Bad key material: {0}")]
    BadKeyMaterial(String),

    #[error("Malformed key id '{0}' (expected '<algorithm>:<version>')")]
    MalformedKeyId(String),

    // ── Remote communication (internal to fetchers) ─────────────────────────

    #[error("HTTP error communicating with remote server '{0}': {1}")]
    RemoteHttp(String, String),

    #[error("Remote server '{0}' returned an unexpected response: {1}")]
    RemoteProtocol(String, String),

    // ── Key store ───────────────────────────────────────────────────────────

    #[error("Key store error: {0}")]
    Store(String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KeyringError {
    /// Map the error to the HTTP status code a federation endpoint would
    /// answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotSigned { .. } => 400,
            Self::NoVerifyKey { .. }
            | Self::StaleVerifyKey { .. }
            | Self::InvalidSignature { .. } => 401,
            Self::BadKeyMaterial(_) | Self::MalformedKeyId(_) => 400,
            Self::RemoteHttp(..) | Self::RemoteProtocol(..) => 502,
            Self::Store(_) | Self::Serialisation(_) | Self::Other(_) => 500,
        }
    }

    /// Machine-readable error code for programmatic handling by clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotSigned { .. }
            | Self::NoVerifyKey { .. }
            | Self::StaleVerifyKey { .. }
            | Self::InvalidSignature { .. } => "M_UNAUTHORIZED",
            _ => "M_UNKNOWN",
        }
    }

    /// True for the authentication-failure family (as opposed to local or
    /// infrastructure faults).
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::NotSigned { .. }
                | Self::NoVerifyKey { .. }
                | Self::StaleVerifyKey { .. }
                | Self::InvalidSignature { .. }
        )
    }
}

impl From<reqwest::Error> for KeyringError {
    fn from(e: reqwest::Error) -> Self {
        let server = e.url().map(|u| u.host_str().unwrap_or("?").to_owned()).unwrap_or_default();
        KeyringError::RemoteHttp(server, e.to_string())
    }
}
