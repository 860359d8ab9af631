//! Key-fetching strategies.
//!
//! A [`KeyFetcher`] is one way of obtaining another server's verify keys.
//! The keyring runs an ordered chain of fetchers, so each strategy only ever
//! sees the keys the previous ones could not satisfy:
//!
//! - [`PerspectivesKeyFetcher`] asks a trusted notary server, requiring the
//!   returned documents to be signed by both the origin and the notary.
//! - [`ServerKeyFetcher`] asks the origin server directly, requiring the
//!   document to be signed by one of the keys it announces.
//!
//! Rejection is silent by contract: a server or key id that cannot be
//! positively validated is absent from the result. Partial failure is never
//! an error, and transport faults degrade to an empty result.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    client::{FederationHttp, urlencoded},
    clock::Clock,
    config::TrustedKeyServerConfig,
    error::KeyringError,
    keys::{ED25519, ServerKeyDocument, VerifyKey, parse_key_id},
    signed_json::{canonical_json, verify_signed_json},
    store::{FetchKeyResult, KeyStore},
};

/// Requested keys: server name → key id → `minimum_valid_until_ts`.
pub type KeyRequests = HashMap<String, HashMap<String, i64>>;

/// Fetched keys: server name → key id → result.
pub type KeyResults = HashMap<String, HashMap<String, FetchKeyResult>>;

/// One strategy for obtaining remote servers' verify keys.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch whichever of the requested keys this strategy can positively
    /// validate, persisting them to the key store before returning.
    ///
    /// Absence is the failure signal: unsatisfiable servers and key ids are
    /// simply missing from the result.
    async fn get_keys(&self, requests: &KeyRequests) -> KeyResults;
}

// ─── Response validation (shared by both fetchers) ───────────────────────────

/// A key document that passed origin-signature validation.
struct ProcessedDocument {
    server_name: String,
    valid_until_ts: i64,
    keys: HashMap<String, FetchKeyResult>,
    /// Canonical JSON bytes of the signed response, as persisted.
    canonical_bytes: Vec<u8>,
}

/// Validate a signed key document against its own embedded keys.
///
/// The document must carry at least one signature by the server it names,
/// made with a key present in its own `verify_keys`; every such signature
/// must verify. Unknown-algorithm key ids are skipped.
fn process_key_document(response: &Value) -> Result<ProcessedDocument, KeyringError> {
    let doc: ServerKeyDocument = serde_json::from_value(response.clone())?;

    let mut verify_keys = HashMap::new();
    for (key_id, entry) in &doc.verify_keys {
        let Ok((algorithm, version)) = parse_key_id(key_id) else { continue };
        if algorithm != ED25519 {
            continue;
        }
        verify_keys.insert(key_id.clone(), VerifyKey::from_base64(version, &entry.key)?);
    }

    let mut self_signed = false;
    if let Some(sigs) = doc.signatures.get(&doc.server_name) {
        for key_id in sigs.keys() {
            if let Some(key) = verify_keys.get(key_id) {
                verify_signed_json(response, &doc.server_name, key)?;
                self_signed = true;
            }
        }
    }
    if !self_signed {
        return Err(KeyringError::RemoteProtocol(
            doc.server_name.clone(),
            "key document is not signed by any of its own verify keys".into(),
        ));
    }

    let keys = verify_keys
        .into_iter()
        .map(|(key_id, verify_key)| {
            (key_id, FetchKeyResult { verify_key, valid_until_ts: doc.valid_until_ts })
        })
        .collect();

    Ok(ProcessedDocument {
        server_name: doc.server_name,
        valid_until_ts: doc.valid_until_ts,
        keys,
        canonical_bytes: canonical_json(response)?.into_bytes(),
    })
}

/// Write a validated document through to the key store, tagged with the
/// vouching server. Failures are logged and swallowed: the fetch already
/// succeeded in memory, only the cache benefit is lost.
async fn store_document(
    store: &Arc<dyn KeyStore>,
    clock: &Arc<dyn Clock>,
    from_server: &str,
    doc: &ProcessedDocument,
) {
    let ts_added_ms = clock.now_ms();

    let entries: Vec<(String, String, FetchKeyResult)> = doc
        .keys
        .iter()
        .map(|(key_id, result)| (doc.server_name.clone(), key_id.clone(), result.clone()))
        .collect();
    if let Err(e) = store.store_server_verify_keys(from_server, ts_added_ms, &entries).await {
        warn!("Failed to cache verify keys for {}: {}", doc.server_name, e);
    }

    for key_id in doc.keys.keys() {
        if let Err(e) = store
            .store_server_keys_json(
                &doc.server_name,
                key_id,
                from_server,
                ts_added_ms,
                doc.valid_until_ts,
                doc.canonical_bytes.clone(),
            )
            .await
        {
            warn!("Failed to cache key document for {}: {}", doc.server_name, e);
        }
    }
}

// ─── Direct fetcher ──────────────────────────────────────────────────────────

/// Fetches keys straight from the origin server's
/// `/_matrix/key/v2/server/{key_id}` endpoint.
pub struct ServerKeyFetcher {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    client: Arc<dyn FederationHttp>,
}

impl ServerKeyFetcher {
    pub fn new(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        client: Arc<dyn FederationHttp>,
    ) -> Self {
        Self { store, clock, client }
    }

    async fn fetch_from_origin(
        &self,
        server_name: &str,
        key_ids: &HashMap<String, i64>,
    ) -> Result<HashMap<String, FetchKeyResult>, KeyringError> {
        // The endpoint returns the server's full current key set whichever
        // key id the path names; use the lexicographically first for a
        // deterministic request.
        let Some(key_id) = key_ids.keys().min() else {
            return Ok(HashMap::new());
        };
        let path = format!("/_matrix/key/v2/server/{}", urlencoded(key_id));
        let response = self.client.get_json(server_name, &path).await?;

        let doc = process_key_document(&response)?;
        // Forged-origin defense: the document must name the server we asked.
        if doc.server_name != server_name {
            return Err(KeyringError::RemoteProtocol(
                server_name.to_owned(),
                format!("key document claims to be for '{}'", doc.server_name),
            ));
        }

        store_document(&self.store, &self.clock, server_name, &doc).await;
        Ok(doc.keys)
    }
}

#[async_trait]
impl KeyFetcher for ServerKeyFetcher {
    async fn get_keys(&self, requests: &KeyRequests) -> KeyResults {
        let fetches = requests.iter().map(|(server_name, key_ids)| async move {
            match self.fetch_from_origin(server_name, key_ids).await {
                Ok(keys) if !keys.is_empty() => Some((server_name.clone(), keys)),
                Ok(_) => None,
                Err(e) => {
                    warn!("Error fetching keys from {}: {}", server_name, e);
                    None
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }
}

// ─── Perspectives fetcher ────────────────────────────────────────────────────

/// A trusted notary with its parsed verify keys.
struct TrustedNotary {
    server_name: String,
    verify_keys: HashMap<String, VerifyKey>,
}

/// Fetches keys from trusted notary servers via `/_matrix/key/v2/query`,
/// requiring each returned document to be double-signed: by the origin it
/// describes and by the notary that relayed it.
pub struct PerspectivesKeyFetcher {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    client: Arc<dyn FederationHttp>,
    notaries: Vec<TrustedNotary>,
}

impl PerspectivesKeyFetcher {
    /// Build the fetcher from configured notaries. Notary keys come from
    /// static configuration and are never fetched over the network.
    pub fn new(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        client: Arc<dyn FederationHttp>,
        trusted_key_servers: &[TrustedKeyServerConfig],
    ) -> Result<Self, KeyringError> {
        let notaries = trusted_key_servers
            .iter()
            .map(|cfg| {
                Ok(TrustedNotary {
                    server_name: cfg.server_name.clone(),
                    verify_keys: cfg.parsed_verify_keys()?,
                })
            })
            .collect::<Result<Vec<_>, KeyringError>>()?;
        Ok(Self { store, clock, client, notaries })
    }

    async fn query_notary(
        &self,
        notary: &TrustedNotary,
        requests: &KeyRequests,
    ) -> Result<KeyResults, KeyringError> {
        let body = json!({ "server_keys": requests });
        let response =
            self.client.post_json(&notary.server_name, "/_matrix/key/v2/query", &body).await?;

        let documents = response.get("server_keys").and_then(Value::as_array).ok_or_else(|| {
            KeyringError::RemoteProtocol(
                notary.server_name.clone(),
                "response is missing 'server_keys'".into(),
            )
        })?;

        let mut results = KeyResults::new();
        for document in documents {
            match self.process_notary_document(notary, document) {
                Ok(doc) => {
                    store_document(&self.store, &self.clock, &notary.server_name, &doc).await;
                    results.entry(doc.server_name.clone()).or_default().extend(doc.keys);
                }
                Err(e) => {
                    warn!("Rejecting key document relayed by {}: {}", notary.server_name, e);
                }
            }
        }
        Ok(results)
    }

    /// Validate the double signature on a relayed key document: the notary's
    /// signature against our configured keys, the origin's against the keys
    /// embedded in the document itself.
    fn process_notary_document(
        &self,
        notary: &TrustedNotary,
        document: &Value,
    ) -> Result<ProcessedDocument, KeyringError> {
        let mut notary_signed = false;
        if let Some(sigs) = document
            .get("signatures")
            .and_then(|sigs| sigs.get(&notary.server_name))
            .and_then(Value::as_object)
        {
            for key_id in sigs.keys() {
                if let Some(key) = notary.verify_keys.get(key_id) {
                    verify_signed_json(document, &notary.server_name, key)?;
                    notary_signed = true;
                }
            }
        }
        if !notary_signed {
            return Err(KeyringError::RemoteProtocol(
                notary.server_name.clone(),
                "key document is missing the notary signature".into(),
            ));
        }

        process_key_document(document)
    }
}

#[async_trait]
impl KeyFetcher for PerspectivesKeyFetcher {
    async fn get_keys(&self, requests: &KeyRequests) -> KeyResults {
        let mut results = KeyResults::new();
        // Notaries are tried in configured order; earlier notaries win,
        // later ones fill remaining gaps.
        for notary in &self.notaries {
            match self.query_notary(notary, requests).await {
                Ok(found) => {
                    for (server_name, keys) in found {
                        let server_results = results.entry(server_name).or_default();
                        for (key_id, result) in keys {
                            server_results.entry(key_id).or_insert(result);
                        }
                    }
                }
                Err(e) => {
                    warn!("Key query to notary {} failed: {}", notary.server_name, e);
                }
            }
        }
        debug!(
            "Perspectives lookup satisfied {} of {} requested servers",
            results.len(),
            requests.len()
        );
        results
    }
}
