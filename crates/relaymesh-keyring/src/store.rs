//! Key store seam and in-memory implementation.
//!
//! The keyring treats the store as append-only: verification never deletes or
//! mutates previously stored keys, it only adds rows with fresh validity.
//! Rows are keyed by (server, key id, vouching server) so duplicate writes
//! are idempotent — the last write for a given key wins.
//!
//! Production deployments can back this trait with their database of choice;
//! [`MemoryKeyStore`] is the built-in implementation for cache-less
//! deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{error::KeyringError, keys::VerifyKey};

/// A key produced by a fetcher: the verify key plus the time until which the
/// vouching server says it may be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchKeyResult {
    pub verify_key: VerifyKey,
    /// Unix millisecond timestamp after which the key must not be trusted.
    pub valid_until_ts: i64,
}

/// A raw signed key-document row, exactly as received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKeyJson {
    pub key_id: String,
    /// The server that vouched for this row: the origin itself for a direct
    /// fetch, the notary for a perspectives fetch.
    pub from_server: String,
    pub ts_added_ms: i64,
    pub ts_valid_until_ms: i64,
    /// Canonical JSON bytes of the signed response document.
    pub key_json: Vec<u8>,
}

/// Lookup triplet for raw key-document rows. A `None` vouching server matches
/// rows from any voucher.
pub type KeyJsonLookup = (String, String, Option<String>);

/// Durable cache of previously fetched keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch cached verify keys for the given (server, key id) pairs. Pairs
    /// with no cached key are absent from the result.
    async fn get_server_verify_keys(
        &self,
        lookups: &[(String, String)],
    ) -> Result<HashMap<(String, String), FetchKeyResult>, KeyringError>;

    /// Cache verify keys vouched for by `from_server` at `ts_added_ms`.
    async fn store_server_verify_keys(
        &self,
        from_server: &str,
        ts_added_ms: i64,
        entries: &[(String, String, FetchKeyResult)],
    ) -> Result<(), KeyringError>;

    /// Fetch raw signed key-document rows for the given lookup triplets.
    /// Every requested triplet is present in the result, possibly with an
    /// empty row list.
    async fn get_server_keys_json(
        &self,
        lookups: &[KeyJsonLookup],
    ) -> Result<HashMap<KeyJsonLookup, Vec<StoredKeyJson>>, KeyringError>;

    /// Store the raw signed key document backing a fetched key.
    async fn store_server_keys_json(
        &self,
        server_name: &str,
        key_id: &str,
        from_server: &str,
        ts_added_ms: i64,
        ts_valid_until_ms: i64,
        key_json: Vec<u8>,
    ) -> Result<(), KeyringError>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

/// In-memory [`KeyStore`]. Thread-safe; suitable for sharing via `Arc`.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    /// (server, key id) → newest cached verify key.
    verify_keys: RwLock<HashMap<(String, String), FetchKeyResult>>,
    /// (server, key id, vouching server) → newest raw document row.
    key_json: RwLock<HashMap<(String, String, String), StoredKeyJson>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get_server_verify_keys(
        &self,
        lookups: &[(String, String)],
    ) -> Result<HashMap<(String, String), FetchKeyResult>, KeyringError> {
        let keys = self.verify_keys.read().await;
        Ok(lookups
            .iter()
            .filter_map(|lookup| keys.get(lookup).map(|k| (lookup.clone(), k.clone())))
            .collect())
    }

    async fn store_server_verify_keys(
        &self,
        _from_server: &str,
        _ts_added_ms: i64,
        entries: &[(String, String, FetchKeyResult)],
    ) -> Result<(), KeyringError> {
        let mut keys = self.verify_keys.write().await;
        for (server_name, key_id, result) in entries {
            keys.insert((server_name.clone(), key_id.clone()), result.clone());
        }
        Ok(())
    }

    async fn get_server_keys_json(
        &self,
        lookups: &[KeyJsonLookup],
    ) -> Result<HashMap<KeyJsonLookup, Vec<StoredKeyJson>>, KeyringError> {
        let rows = self.key_json.read().await;
        let mut out = HashMap::new();
        for lookup in lookups {
            let (server_name, key_id, from_server) = lookup;
            let matches: Vec<StoredKeyJson> = rows
                .iter()
                .filter(|((srv, kid, voucher), _)| {
                    srv == server_name
                        && kid == key_id
                        && from_server.as_ref().is_none_or(|f| f == voucher)
                })
                .map(|(_, row)| row.clone())
                .collect();
            out.insert(lookup.clone(), matches);
        }
        Ok(out)
    }

    async fn store_server_keys_json(
        &self,
        server_name: &str,
        key_id: &str,
        from_server: &str,
        ts_added_ms: i64,
        ts_valid_until_ms: i64,
        key_json: Vec<u8>,
    ) -> Result<(), KeyringError> {
        let mut rows = self.key_json.write().await;
        rows.insert(
            (server_name.to_owned(), key_id.to_owned(), from_server.to_owned()),
            StoredKeyJson {
                key_id: key_id.to_owned(),
                from_server: from_server.to_owned(),
                ts_added_ms,
                ts_valid_until_ms,
                key_json,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKeyPair;

    fn result_for(kp: &SigningKeyPair, valid_until_ts: i64) -> FetchKeyResult {
        FetchKeyResult { verify_key: kp.verify_key(), valid_until_ts }
    }

    #[tokio::test]
    async fn verify_keys_round_trip() {
        let store = MemoryKeyStore::new();
        let kp = SigningKeyPair::generate_with_version("1");

        store
            .store_server_verify_keys(
                "remote.example.com",
                100,
                &[("remote.example.com".into(), kp.key_id.clone(), result_for(&kp, 1000))],
            )
            .await
            .unwrap();

        let lookup = ("remote.example.com".to_owned(), kp.key_id.clone());
        let found = store.get_server_verify_keys(std::slice::from_ref(&lookup)).await.unwrap();
        assert_eq!(found[&lookup], result_for(&kp, 1000));

        // Unknown keys are simply absent.
        let missing = ("remote.example.com".to_owned(), "ed25519:nope".to_owned());
        let found = store.get_server_verify_keys(&[missing.clone()]).await.unwrap();
        assert!(!found.contains_key(&missing));
    }

    #[tokio::test]
    async fn repeated_writes_are_idempotent() {
        let store = MemoryKeyStore::new();
        let kp = SigningKeyPair::generate_with_version("1");
        let entry =
            ("remote.example.com".to_owned(), kp.key_id.clone(), result_for(&kp, 1000));

        for _ in 0..3 {
            store
                .store_server_verify_keys("remote.example.com", 100, &[entry.clone()])
                .await
                .unwrap();
        }

        let lookup = ("remote.example.com".to_owned(), kp.key_id.clone());
        let found = store.get_server_verify_keys(std::slice::from_ref(&lookup)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&lookup].valid_until_ts, 1000);
    }

    #[tokio::test]
    async fn key_json_voucher_filter() {
        let store = MemoryKeyStore::new();
        store
            .store_server_keys_json("origin", "ed25519:1", "origin", 100, 1000, b"{}".to_vec())
            .await
            .unwrap();
        store
            .store_server_keys_json("origin", "ed25519:1", "notary", 100, 1000, b"{}".to_vec())
            .await
            .unwrap();

        let any = ("origin".to_owned(), "ed25519:1".to_owned(), None);
        let rows = store.get_server_keys_json(std::slice::from_ref(&any)).await.unwrap();
        assert_eq!(rows[&any].len(), 2);

        let notary_only =
            ("origin".to_owned(), "ed25519:1".to_owned(), Some("notary".to_owned()));
        let rows = store.get_server_keys_json(std::slice::from_ref(&notary_only)).await.unwrap();
        assert_eq!(rows[&notary_only].len(), 1);
        assert_eq!(rows[&notary_only][0].from_server, "notary");
    }
}
