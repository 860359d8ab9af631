//! Verification orchestration.
//!
//! The [`Keyring`] authenticates signed JSON objects received from remote
//! servers. For each batch of [`VerifyJsonRequest`]s it:
//!
//! 1. rejects unsigned objects immediately, with no I/O;
//! 2. groups the rest by origin server and merges their key requirements
//!    (the strictest `minimum_valid_until_ts` per key id wins);
//! 3. queues behind any in-flight lookup for the same server, so at most one
//!    outbound fetch per server is ever outstanding;
//! 4. answers from the key store when a cached key meets the requirement,
//!    otherwise runs the fetcher chain in order;
//! 5. verifies each request's signature against the resolved key.
//!
//! Signature verification is cheap and side-effect-free, so only the network
//! fetch is deduplicated — every request still verifies independently.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{
    FutureExt as _,
    future::{BoxFuture, Shared, join_all},
};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{Instrument as _, debug, debug_span, warn};

use crate::{
    client::MatrixHttpClient,
    clock::{Clock, SystemClock},
    config::KeyringConfig,
    error::KeyringError,
    fetcher::{KeyFetcher, KeyRequests, PerspectivesKeyFetcher, ServerKeyFetcher},
    signed_json::{signature_key_ids, verify_signed_json},
    store::{FetchKeyResult, KeyStore},
};

// ─── Requests and results ────────────────────────────────────────────────────

/// A single object to verify against its claimed origin server.
#[derive(Debug, Clone)]
pub struct VerifyJsonRequest {
    pub server_name: String,
    pub json_object: Value,
    /// The key that signed the object must be vouched valid until at least
    /// this Unix millisecond timestamp (inclusive).
    pub minimum_valid_until_ts: i64,
}

impl VerifyJsonRequest {
    pub fn new(
        server_name: impl Into<String>,
        json_object: Value,
        minimum_valid_until_ts: i64,
    ) -> Self {
        Self { server_name: server_name.into(), json_object, minimum_valid_until_ts }
    }
}

/// The pending outcome of one [`VerifyJsonRequest`].
///
/// Resolves independently of its batch siblings; dropping it does not cancel
/// the underlying lookup.
pub struct PendingVerification {
    rx: oneshot::Receiver<Result<(), KeyringError>>,
}

impl Future for PendingVerification {
    type Output = Result<(), KeyringError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|recv| match recv {
            Ok(result) => result,
            Err(_) => Err(KeyringError::Other(anyhow::anyhow!("verification task was dropped"))),
        })
    }
}

/// Completion handle for an in-flight per-server lookup. Cloneable so every
/// queued caller can await the same fetch.
type LookupHandle = Shared<BoxFuture<'static, ()>>;

/// One request's share of a server group: everything needed to finish the
/// verification once keys are available.
struct GroupItem {
    json_object: Value,
    minimum_valid_until_ts: i64,
    /// Key ids the origin signed the object with, in signature-block order.
    key_ids: Vec<String>,
    tx: oneshot::Sender<Result<(), KeyringError>>,
}

// ─── Keyring ─────────────────────────────────────────────────────────────────

/// Verifies signed JSON objects from remote servers, fetching and caching
/// their signing keys as needed.
///
/// Cheap to clone; clones share the fetcher chain, the key store, and the
/// in-flight lookup table.
#[derive(Clone)]
pub struct Keyring {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyStore>,
    /// Tried in order; the first fetcher satisfying a key id wins for it.
    fetchers: Vec<Arc<dyn KeyFetcher>>,
    /// The latest in-flight lookup per server. Guarded by a plain mutex that
    /// is never held across an await; entries are removed by the lookup that
    /// owns them, and only while still the registered entry.
    key_downloads: Mutex<HashMap<String, LookupHandle>>,
}

impl Keyring {
    /// Build a keyring over an explicit fetcher chain.
    pub fn new(store: Arc<dyn KeyStore>, fetchers: Vec<Arc<dyn KeyFetcher>>) -> Self {
        Self { inner: Arc::new(Inner { store, fetchers, key_downloads: Mutex::new(HashMap::new()) }) }
    }

    /// Build a keyring with the standard fetcher chain for the given
    /// configuration: trusted notaries first (one round trip can answer for
    /// many servers), then a direct fetch from the origin.
    pub fn from_config(
        config: &KeyringConfig,
        store: Arc<dyn KeyStore>,
    ) -> Result<Self, KeyringError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let client = Arc::new(MatrixHttpClient::with_port(
            Duration::from_secs(config.request_timeout_secs),
            config.federation_port,
        ));

        let mut fetchers: Vec<Arc<dyn KeyFetcher>> = Vec::new();
        if !config.trusted_key_servers.is_empty() {
            fetchers.push(Arc::new(PerspectivesKeyFetcher::new(
                store.clone(),
                clock.clone(),
                client.clone(),
                &config.trusted_key_servers,
            )?));
        }
        fetchers.push(Arc::new(ServerKeyFetcher::new(store.clone(), clock, client)));

        Ok(Self::new(store, fetchers))
    }

    /// Verify a batch of signed objects. Returns one pending result per
    /// request, positionally, each independently awaitable.
    ///
    /// Must be called from within a tokio runtime; the lookup work runs on a
    /// spawned task so results resolve even if the caller awaits them out of
    /// order.
    pub fn verify_json_objects_for_server(
        &self,
        requests: Vec<VerifyJsonRequest>,
    ) -> Vec<PendingVerification> {
        let mut pending = Vec::with_capacity(requests.len());
        let mut groups: HashMap<String, Vec<GroupItem>> = HashMap::new();

        for request in requests {
            let (tx, rx) = oneshot::channel();
            pending.push(PendingVerification { rx });

            let key_ids = signature_key_ids(&request.json_object, &request.server_name);
            if key_ids.is_empty() {
                // No usable signature by the claimed origin: reject without
                // any fetch.
                let _ = tx.send(Err(KeyringError::NotSigned {
                    server_name: request.server_name.clone(),
                }));
                continue;
            }

            groups.entry(request.server_name).or_default().push(GroupItem {
                json_object: request.json_object,
                minimum_valid_until_ts: request.minimum_valid_until_ts,
                key_ids,
                tx,
            });
        }

        if groups.is_empty() {
            return pending;
        }

        let inner = self.inner.clone();
        let span = debug_span!("key_lookup", servers = groups.len());
        tokio::spawn(
            async move {
                // One completion handle per server, registered before any
                // fetch starts so later callers queue behind this lookup.
                let mut done_txs = HashMap::new();
                let mut handles = HashMap::new();
                for server_name in groups.keys() {
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    done_txs.insert(server_name.clone(), done_tx);
                    // Resolves on completion, and on abandonment: a dropped
                    // sender must still release queued callers.
                    handles.insert(server_name.clone(), done_rx.map(|_| ()).boxed().shared());
                }

                inner.wait_for_previous_lookups(handles.clone()).await;

                join_all(groups.into_iter().map(|(server_name, items)| {
                    let inner = inner.clone();
                    let handle = handles[&server_name].clone();
                    let done_tx =
                        done_txs.remove(&server_name).expect("one sender per server group");
                    async move {
                        inner.process_server_group(&server_name, items).await;

                        // Deregister, but only if we are still the current
                        // entry — a queued lookup may have replaced us.
                        {
                            let mut downloads = inner.key_downloads.lock().expect("not poisoned");
                            if downloads.get(&server_name).is_some_and(|h| h.ptr_eq(&handle)) {
                                downloads.remove(&server_name);
                            }
                        }
                        let _ = done_tx.send(());
                    }
                }))
                .await;
            }
            .instrument(span),
        );

        pending
    }

    /// Verify a single signed object; convenience wrapper around
    /// [`Self::verify_json_objects_for_server`].
    pub async fn verify_json_for_server(
        &self,
        server_name: &str,
        json_object: Value,
        minimum_valid_until_ts: i64,
    ) -> Result<(), KeyringError> {
        let mut results = self.verify_json_objects_for_server(vec![VerifyJsonRequest::new(
            server_name,
            json_object,
            minimum_valid_until_ts,
        )]);
        results.remove(0).await
    }
}

impl Inner {
    /// Queue behind any in-flight lookups for the servers in `new_lookups`,
    /// then register the new handles as the current in-flight entries.
    ///
    /// This serializes fetches per server: lookup N+1 never starts before
    /// lookup N has resolved, whichever key ids either asked for.
    async fn wait_for_previous_lookups(&self, new_lookups: HashMap<String, LookupHandle>) {
        loop {
            let in_flight: Vec<LookupHandle> = {
                let downloads = self.key_downloads.lock().expect("not poisoned");
                new_lookups.keys().filter_map(|server| downloads.get(server).cloned()).collect()
            };

            if in_flight.is_empty() {
                let mut downloads = self.key_downloads.lock().expect("not poisoned");
                for (server_name, handle) in new_lookups {
                    downloads.insert(server_name, handle);
                }
                return;
            }

            debug!("Waiting on {} in-flight key lookups", in_flight.len());
            join_all(in_flight).await;
        }
    }

    /// Resolve keys for one server group and deliver every request's result.
    async fn process_server_group(&self, server_name: &str, items: Vec<GroupItem>) {
        // Merge requirements: the strictest validity demand per key id.
        let mut requirements: HashMap<String, i64> = HashMap::new();
        for item in &items {
            for key_id in &item.key_ids {
                requirements
                    .entry(key_id.clone())
                    .and_modify(|ts| *ts = (*ts).max(item.minimum_valid_until_ts))
                    .or_insert(item.minimum_valid_until_ts);
            }
        }

        let found = match self.find_verify_keys(server_name, &requirements).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Key lookup for {} failed: {}", server_name, e);
                for item in items {
                    let _ = item.tx.send(Err(KeyringError::Store(format!(
                        "key lookup for '{server_name}' failed"
                    ))));
                }
                return;
            }
        };

        for item in items {
            let result = verify_item(server_name, &item, &found);
            let _ = item.tx.send(result);
        }
    }

    /// Look up keys in the store, then run the fetcher chain for whatever the
    /// store could not satisfy. Returns the best candidate per key id, which
    /// may still fall short of the merged requirement — per-request validity
    /// is judged against each request's own minimum.
    ///
    /// Only store read failures propagate; fetcher faults degrade to "found
    /// nothing" and the chain continues.
    async fn find_verify_keys(
        &self,
        server_name: &str,
        requirements: &HashMap<String, i64>,
    ) -> Result<HashMap<String, FetchKeyResult>, KeyringError> {
        let mut found: HashMap<String, FetchKeyResult> = HashMap::new();
        let mut missing: HashMap<String, i64> = HashMap::new();

        let lookups: Vec<(String, String)> =
            requirements.keys().map(|key_id| (server_name.to_owned(), key_id.clone())).collect();
        let cached = self.store.get_server_verify_keys(&lookups).await?;

        for (key_id, &minimum_valid_until_ts) in requirements {
            match cached.get(&(server_name.to_owned(), key_id.clone())) {
                Some(result) => {
                    if result.valid_until_ts < minimum_valid_until_ts {
                        missing.insert(key_id.clone(), minimum_valid_until_ts);
                    }
                    // Keep even a stale key as a candidate: a request with a
                    // smaller minimum may still be satisfied by it.
                    found.insert(key_id.clone(), result.clone());
                }
                None => {
                    missing.insert(key_id.clone(), minimum_valid_until_ts);
                }
            }
        }

        for fetcher in &self.fetchers {
            if missing.is_empty() {
                break;
            }
            let requests: KeyRequests =
                HashMap::from([(server_name.to_owned(), missing.clone())]);
            let results = fetcher.get_keys(&requests).await;
            let Some(server_results) = results.get(server_name) else { continue };

            missing.retain(|key_id, &mut minimum_valid_until_ts| {
                let Some(result) = server_results.get(key_id) else { return true };
                let improves = found
                    .get(key_id)
                    .is_none_or(|cur| result.valid_until_ts > cur.valid_until_ts);
                if improves {
                    found.insert(key_id.clone(), result.clone());
                }
                result.valid_until_ts < minimum_valid_until_ts
            });
        }

        Ok(found)
    }
}

/// Judge one request against the resolved keys. Any signed key id with a key
/// satisfying the request's minimum can verify it; a stale key is only an
/// error when no signed key id has a satisfying one.
fn verify_item(
    server_name: &str,
    item: &GroupItem,
    found: &HashMap<String, FetchKeyResult>,
) -> Result<(), KeyringError> {
    let candidates: Vec<(&String, &FetchKeyResult)> = item
        .key_ids
        .iter()
        .filter_map(|key_id| found.get(key_id).map(|result| (key_id, result)))
        .collect();

    let satisfying = candidates
        .iter()
        .find(|(_, result)| result.valid_until_ts >= item.minimum_valid_until_ts);
    let Some(&(key_id, result)) = satisfying.or_else(|| candidates.first()) else {
        return Err(KeyringError::NoVerifyKey {
            server_name: server_name.to_owned(),
            key_ids: item.key_ids.join(", "),
        });
    };

    // Inclusive boundary: a key valid until exactly the required time passes.
    if result.valid_until_ts < item.minimum_valid_until_ts {
        return Err(KeyringError::StaleVerifyKey {
            server_name: server_name.to_owned(),
            key_id: key_id.clone(),
            valid_until_ts: result.valid_until_ts,
            minimum_valid_until_ts: item.minimum_valid_until_ts,
        });
    }

    verify_signed_json(&item.json_object, server_name, &result.verify_key)
}
