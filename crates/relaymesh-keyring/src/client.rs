//! Outbound federation HTTP seam.
//!
//! Key fetchers talk to remote servers through [`FederationHttp`], which
//! addresses a destination by its bare server name. [`MatrixHttpClient`] is
//! the reqwest-backed implementation: `https://<name>:8448` unless the name
//! carries an explicit port. Timeout handling lives here; a timed-out request
//! surfaces as [`KeyringError::RemoteHttp`] and is treated by the fetchers as
//! "found nothing".

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::KeyringError;

/// Default federation port (Matrix port 8448).
pub const DEFAULT_FEDERATION_PORT: u16 = 8448;

/// JSON-over-HTTP client capable of reaching a federation destination.
#[async_trait]
pub trait FederationHttp: Send + Sync {
    async fn get_json(&self, destination: &str, path: &str) -> Result<Value, KeyringError>;

    async fn post_json(
        &self,
        destination: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, KeyringError>;
}

// ─── reqwest implementation ──────────────────────────────────────────────────

/// Production [`FederationHttp`] backed by a pooled reqwest client.
pub struct MatrixHttpClient {
    http: reqwest::Client,
    federation_port: u16,
}

impl MatrixHttpClient {
    /// Create a client with the given request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self::with_port(timeout, DEFAULT_FEDERATION_PORT)
    }

    pub fn with_port(timeout: Duration, federation_port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Relaymesh-Keyring/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build reqwest client");
        Self { http, federation_port }
    }

    fn base_url(&self, destination: &str) -> String {
        if has_explicit_port(destination) {
            format!("https://{destination}")
        } else {
            format!("https://{}:{}", destination, self.federation_port)
        }
    }
}

#[async_trait]
impl FederationHttp for MatrixHttpClient {
    async fn get_json(&self, destination: &str, path: &str) -> Result<Value, KeyringError> {
        let url = format!("{}{}", self.base_url(destination), path);
        debug!("Federation GET {}", url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| KeyringError::RemoteHttp(destination.to_owned(), e.to_string()))?;
        Ok(resp.json().await?)
    }

    async fn post_json(
        &self,
        destination: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, KeyringError> {
        let url = format!("{}{}", self.base_url(destination), path);
        debug!("Federation POST {}", url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| KeyringError::RemoteHttp(destination.to_owned(), e.to_string()))?;
        Ok(resp.json().await?)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

pub(crate) fn urlencoded(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn has_explicit_port(server_name: &str) -> bool {
    // IPv6 literal with port: [::1]:8448
    if server_name.starts_with('[') {
        return server_name.contains("]:");
    }
    // hostname:port — but ignore IPv6 with extra colons.
    let colon_count = server_name.chars().filter(|&c| c == ':').count();
    colon_count > 0 && colon_count < 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_port_detection() {
        assert!(has_explicit_port("remote.example.com:8448"));
        assert!(!has_explicit_port("remote.example.com"));
        assert!(has_explicit_port("[::1]:8448"));
        assert!(!has_explicit_port("::1")); // bare IPv6 — no port
    }

    #[test]
    fn base_url_appends_default_port() {
        let client = MatrixHttpClient::new(Duration::from_secs(5));
        assert_eq!(client.base_url("remote.example.com"), "https://remote.example.com:8448");
        assert_eq!(client.base_url("remote.example.com:443"), "https://remote.example.com:443");
    }

    #[test]
    fn key_ids_are_path_safe() {
        assert_eq!(urlencoded("ed25519:abc"), "ed25519%3Aabc");
    }
}
