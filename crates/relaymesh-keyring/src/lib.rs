//! # relaymesh-keyring
//!
//! Federation key verification for Relaymesh.
//!
//! Remote servers sign every federated payload with their Ed25519 signing
//! keys. This crate authenticates those payloads: it fetches and caches the
//! remote servers' public keys — directly from the origin or through trusted
//! notary servers — and checks signatures against keys that are still inside
//! their validity window.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► Keyring::verify_json_objects_for_server
//!               │
//!               ├── unsigned? ──► rejected, no I/O
//!               │
//!               ├── wait_for_previous_lookups   (≤1 fetch per server)
//!               │
//!               ├── KeyStore (cache) ──► fresh enough? ──► verify
//!               │
//!               └── KeyFetcher chain, in order:
//!                     PerspectivesKeyFetcher ──► notary, double-signed
//!                     ServerKeyFetcher       ──► origin, self-signed
//! ```
//!
//! ## Key concepts
//!
//! - **Verify keys** (`keys.rs`): Ed25519 public keys identified as
//!   `ed25519:<version>`, published in signed key documents at
//!   `/_matrix/key/v2/server`.
//! - **Signed JSON** (`signed_json.rs`): canonical-JSON signing and the
//!   inline `signatures` block.
//! - **Fetch strategies** (`fetcher.rs`): an ordered chain of ways to obtain
//!   keys; rejection is silent by contract — an entry a fetcher cannot
//!   positively validate is simply absent from its result.
//! - **Orchestration** (`keyring.rs`): requirement merging, per-server fetch
//!   deduplication, and the verification pipeline.
//! - **Key store** (`store.rs`): append-only cache of fetched keys and the
//!   raw signed documents that vouched for them.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod keyring;
pub mod keys;
pub mod signed_json;
pub mod store;

pub use client::{FederationHttp, MatrixHttpClient};
pub use clock::{Clock, SystemClock};
pub use config::{KeyringConfig, TrustedKeyServerConfig};
pub use error::KeyringError;
pub use fetcher::{KeyFetcher, KeyRequests, KeyResults, PerspectivesKeyFetcher, ServerKeyFetcher};
pub use keyring::{Keyring, PendingVerification, VerifyJsonRequest};
pub use keys::{ServerKeyDocument, SigningKeyPair, VerifyKey};
pub use store::{FetchKeyResult, KeyStore, MemoryKeyStore, StoredKeyJson};
