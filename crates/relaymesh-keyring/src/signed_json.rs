//! Canonical JSON and the `signatures` block.
//!
//! Signed federation objects carry their signatures inline:
//!
//! ```json
//! {
//!   "content": { ... },
//!   "signatures": {
//!     "origin.example.com": { "ed25519:a1b2c3": "<unpadded-base64-signature>" }
//!   }
//! }
//! ```
//!
//! The signed bytes are the canonical JSON of the object with the
//! `signatures` and `unsigned` fields removed. Canonical JSON means keys
//! sorted lexicographically and no insignificant whitespace, following the
//! Matrix canonical JSON rules.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{
    error::KeyringError,
    keys::{SigningKeyPair, VerifyKey, is_supported_key_id},
};

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &Value) -> Result<String, KeyringError> {
    Ok(sort_keys(value).to_string())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// The bytes a signature covers: the object minus `signatures` and `unsigned`.
fn signable_bytes(object: &Value) -> Result<Vec<u8>, KeyringError> {
    let mut stripped = object.clone();
    if let Some(map) = stripped.as_object_mut() {
        map.remove("signatures");
        map.remove("unsigned");
    }
    Ok(canonical_json(&stripped)?.into_bytes())
}

/// Sign a JSON object in place, adding the signature under
/// `signatures.<server_name>.<key_id>`. Existing signatures by other servers
/// are preserved.
pub fn sign_json(
    kp: &SigningKeyPair,
    server_name: &str,
    object: &mut Value,
) -> Result<(), KeyringError> {
    let sig = kp.sign_bytes(&signable_bytes(object)?);

    let map = object
        .as_object_mut()
        .ok_or_else(|| KeyringError::Other(anyhow::anyhow!("can only sign a JSON object")))?;
    let sigs = map
        .entry("signatures")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| KeyringError::Other(anyhow::anyhow!("'signatures' must be an object")))?;
    sigs.entry(server_name.to_owned())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| {
            KeyringError::Other(anyhow::anyhow!("'signatures.{server_name}' must be an object"))
        })?
        .insert(kp.key_id.clone(), Value::String(sig));
    Ok(())
}

/// The key ids `server_name` has signed `object` with, restricted to
/// algorithms this keyring can verify. Empty means "not usably signed".
pub fn signature_key_ids(object: &Value, server_name: &str) -> Vec<String> {
    object
        .get("signatures")
        .and_then(|sigs| sigs.get(server_name))
        .and_then(Value::as_object)
        .map(|m| m.keys().filter(|id| is_supported_key_id(id)).cloned().collect())
        .unwrap_or_default()
}

/// Verify `server_name`'s signature on `object` with the given key.
pub fn verify_signed_json(
    object: &Value,
    server_name: &str,
    key: &VerifyKey,
) -> Result<(), KeyringError> {
    let key_id = key.key_id();
    let sig = object
        .get("signatures")
        .and_then(|sigs| sigs.get(server_name))
        .and_then(|by_server| by_server.get(&key_id))
        .and_then(Value::as_str)
        .ok_or_else(|| KeyringError::NotSigned { server_name: server_name.to_owned() })?;

    key.verify(&signable_bytes(object)?, sig).map_err(|_| KeyringError::InvalidSignature {
        server_name: server_name.to_owned(),
        key_id,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "a": [{"y": 2, "x": 1}]}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"a":[{"x":1,"y":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = SigningKeyPair::generate_with_version("1");
        let mut object = json!({"foo": "bar", "baz": 42});
        sign_json(&kp, "origin.example.com", &mut object).unwrap();

        assert_eq!(signature_key_ids(&object, "origin.example.com"), vec!["ed25519:1"]);
        verify_signed_json(&object, "origin.example.com", &kp.verify_key()).unwrap();
    }

    #[test]
    fn signature_excludes_signatures_and_unsigned() {
        let kp = SigningKeyPair::generate();
        let mut object = json!({"foo": "bar"});
        sign_json(&kp, "origin.example.com", &mut object).unwrap();

        // Mutating `unsigned` must not invalidate the signature.
        object.as_object_mut().unwrap().insert("unsigned".into(), json!({"age": 1000}));
        verify_signed_json(&object, "origin.example.com", &kp.verify_key()).unwrap();

        // Mutating signed content must.
        object.as_object_mut().unwrap().insert("foo".into(), json!("tampered"));
        let err = verify_signed_json(&object, "origin.example.com", &kp.verify_key()).unwrap_err();
        assert!(matches!(err, KeyringError::InvalidSignature { .. }));
    }

    #[test]
    fn multiple_signers_coexist() {
        let kp1 = SigningKeyPair::generate_with_version("1");
        let kp2 = SigningKeyPair::generate_with_version("2");
        let mut object = json!({"foo": "bar"});
        sign_json(&kp1, "one.example.com", &mut object).unwrap();
        sign_json(&kp2, "two.example.com", &mut object).unwrap();

        verify_signed_json(&object, "one.example.com", &kp1.verify_key()).unwrap();
        verify_signed_json(&object, "two.example.com", &kp2.verify_key()).unwrap();
    }

    #[test]
    fn unsupported_algorithms_are_not_usable_signatures() {
        let object = json!({"signatures": {"origin.example.com": {"rsa:1": "sig"}}});
        assert!(signature_key_ids(&object, "origin.example.com").is_empty());
    }

    #[test]
    fn unsigned_object_has_no_key_ids() {
        assert!(signature_key_ids(&json!({}), "origin.example.com").is_empty());
    }
}
