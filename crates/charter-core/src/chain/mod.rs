//! SHA-256 content hashing and hash-chain linking.
//!
//! Each event's `content_hash` is the lowercase hex SHA-256 digest of the
//! canonical encoding of its signable subset:
//!
//! ```text
//! {agent_id, event_type, local_timestamp, payload,
//!  signature, witness_id, witness_signature}
//! ```
//!
//! All seven keys are always present. Absent optional values are encoded as
//! JSON `null`, never omitted, so writers and verifiers cannot disagree about
//! whether a field participates. Byte fields are lowercase hex strings.
//! `prev_hash`, `content_hash`, `sequence` and the authority timestamp are
//! deliberately excluded: the hash identifies the content, and the link is
//! stored next to it.
//!
//! The first event links to [`GENESIS_HASH`]. Every later event links to the
//! content hash of its predecessor. Hashes are format-checked with
//! [`validate_hash`] before being trusted as links and compared with
//! [`hashes_match`], which runs in constant time.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::canonical::{CanonicalizationError, canonicalize_value};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Link value of the first event in a ledger: 64 ASCII `'0'` characters.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// `hash_alg_version` for SHA-256 over the canonical signable subset.
pub const HASH_ALG_SHA256_CANONICAL: u16 = 1;

/// A hash string failed format validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed hash {value:?}: {reason}")]
pub struct MalformedHashError {
    /// The rejected value (truncated to 80 characters).
    pub value: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl MalformedHashError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.chars().take(80).collect(),
            reason,
        }
    }
}

/// Returns the genesis link constant.
#[must_use]
pub const fn genesis_hash() -> &'static str {
    GENESIS_HASH
}

/// Returns `true` if `hash` is the genesis constant.
#[must_use]
pub fn is_genesis(hash: &str) -> bool {
    hashes_match(hash, GENESIS_HASH)
}

/// Checks that `candidate` is exactly 64 lowercase hex characters.
///
/// # Errors
///
/// Returns [`MalformedHashError`] describing the first violated rule.
pub fn validate_hash(candidate: &str) -> Result<(), MalformedHashError> {
    if candidate.len() != HASH_HEX_LEN {
        return Err(MalformedHashError::new(
            candidate,
            "expected 64 hex characters",
        ));
    }
    if !candidate
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(MalformedHashError::new(
            candidate,
            "expected lowercase hex digits only",
        ));
    }
    Ok(())
}

/// Constant-time equality for hash strings.
///
/// The comparison time does not depend on where the inputs first differ.
/// Inputs of different lengths compare unequal.
#[must_use]
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Derives the `prev_hash` for a new event from its predecessor's content
/// hash, or genesis when there is no predecessor.
///
/// # Errors
///
/// Returns [`MalformedHashError`] if the predecessor hash is not a valid
/// digest. It is never chained as-is.
pub fn derive_prev_hash(previous: Option<&str>) -> Result<String, MalformedHashError> {
    match previous {
        None => Ok(GENESIS_HASH.to_owned()),
        Some(hash) => {
            validate_hash(hash)?;
            Ok(hash.to_owned())
        },
    }
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Borrowed view of the fields covered by an event's content hash.
#[derive(Debug, Clone, Copy)]
pub struct SignableFields<'a> {
    /// Event type.
    pub event_type: &'a str,
    /// Opaque payload.
    pub payload: &'a Value,
    /// Optional agent identity.
    pub agent_id: Option<&'a str>,
    /// Writer clock, nanoseconds since the Unix epoch.
    pub local_timestamp_ns: u64,
    /// Writer signature.
    pub signature: Option<&'a [u8]>,
    /// Witness identity.
    pub witness_id: Option<&'a str>,
    /// Witness signature.
    pub witness_signature: Option<&'a [u8]>,
}

impl SignableFields<'_> {
    /// Builds the JSON object that is canonicalized for hashing.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("agent_id".into(), optional_str(self.agent_id));
        obj.insert("event_type".into(), Value::String(self.event_type.to_owned()));
        obj.insert("local_timestamp".into(), Value::from(self.local_timestamp_ns));
        obj.insert("payload".into(), self.payload.clone());
        obj.insert("signature".into(), optional_hex(self.signature));
        obj.insert("witness_id".into(), optional_str(self.witness_id));
        obj.insert(
            "witness_signature".into(),
            optional_hex(self.witness_signature),
        );
        Value::Object(obj)
    }

    /// Canonical bytes of the signable subset.
    ///
    /// # Errors
    ///
    /// Propagates [`CanonicalizationError`] from the payload.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, CanonicalizationError> {
        canonicalize_value(&self.to_value())
    }
}

fn optional_str(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::String(s.to_owned()))
}

fn optional_hex(value: Option<&[u8]>) -> Value {
    value.map_or(Value::Null, |bytes| Value::String(hex::encode(bytes)))
}

/// Computes the content hash of an event's signable subset.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] if the payload cannot be encoded
/// deterministically.
pub fn compute_content_hash(fields: &SignableFields<'_>) -> Result<String, CanonicalizationError> {
    Ok(sha256_hex(&fields.to_canonical_bytes()?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields<'a>(payload: &'a Value) -> SignableFields<'a> {
        SignableFields {
            event_type: "motion.filed",
            payload,
            agent_id: None,
            local_timestamp_ns: 1_700_000_000_000_000_000,
            signature: None,
            witness_id: None,
            witness_signature: None,
        }
    }

    #[test]
    fn test_genesis_is_sixty_four_zeros() {
        assert_eq!(genesis_hash(), "0".repeat(64));
        assert!(validate_hash(GENESIS_HASH).is_ok());
        assert!(is_genesis(&"0".repeat(64)));
    }

    #[test]
    fn test_derive_prev_hash() {
        assert_eq!(derive_prev_hash(None).unwrap(), GENESIS_HASH);

        let hash = sha256_hex(b"previous");
        assert_eq!(derive_prev_hash(Some(&hash)).unwrap(), hash);
    }

    #[test]
    fn test_derive_prev_hash_rejects_malformed() {
        let err = derive_prev_hash(Some("abc")).unwrap_err();
        assert_eq!(err.reason, "expected 64 hex characters");

        let upper = sha256_hex(b"x").to_uppercase();
        let err = derive_prev_hash(Some(&upper)).unwrap_err();
        assert_eq!(err.reason, "expected lowercase hex digits only");

        let not_hex = "g".repeat(64);
        assert!(validate_hash(&not_hex).is_err());
    }

    #[test]
    fn test_hashes_match() {
        let a = sha256_hex(b"a");
        let b = sha256_hex(b"b");
        assert!(hashes_match(&a, &a.clone()));
        assert!(!hashes_match(&a, &b));
        assert!(!hashes_match(&a, &a[..63]));
    }

    #[test]
    fn test_published_vector_unsigned() {
        let payload = json!({"votes": 3, "motion": "quorum"});
        assert_eq!(
            compute_content_hash(&fields(&payload)).unwrap(),
            "15c204ca8d77b698cb371a6023804c64a3dbd75b6e07285501cc34109689cc97"
        );
    }

    #[test]
    fn test_published_vector_attributed() {
        let payload = json!({"motion": "quorum", "votes": 3});
        let signed = SignableFields {
            agent_id: Some("clerk-7"),
            signature: Some(&[0x0a, 0x0b]),
            witness_id: Some("w-1"),
            witness_signature: Some(&[0xff]),
            ..fields(&payload)
        };
        assert_eq!(
            compute_content_hash(&signed).unwrap(),
            "b72cc32ffafbd60920113123f91dacdf73fb280866e1190a6c33c5ddd71c306b"
        );
    }

    #[test]
    fn test_absent_agent_id_is_encoded_as_null() {
        let payload = json!({});
        let bytes = fields(&payload).to_canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"agent_id":null,"event_type":"motion.filed""#));
    }

    #[test]
    fn test_every_signable_field_changes_hash() {
        let payload = json!({"n": 1});
        let other_payload = json!({"n": 2});
        let base = compute_content_hash(&fields(&payload)).unwrap();

        let variants = [
            SignableFields {
                event_type: "motion.withdrawn",
                ..fields(&payload)
            },
            fields(&other_payload),
            SignableFields {
                agent_id: Some("a"),
                ..fields(&payload)
            },
            SignableFields {
                local_timestamp_ns: 1,
                ..fields(&payload)
            },
            SignableFields {
                signature: Some(&[1]),
                ..fields(&payload)
            },
            SignableFields {
                witness_id: Some("w"),
                ..fields(&payload)
            },
            SignableFields {
                witness_signature: Some(&[1]),
                ..fields(&payload)
            },
        ];
        for variant in &variants {
            assert_ne!(compute_content_hash(variant).unwrap(), base);
        }
    }

    #[test]
    fn test_empty_agent_id_differs_from_absent() {
        let payload = json!(null);
        let absent = compute_content_hash(&fields(&payload)).unwrap();
        let empty = compute_content_hash(&SignableFields {
            agent_id: Some(""),
            ..fields(&payload)
        })
        .unwrap();
        assert_ne!(absent, empty);
    }
}
