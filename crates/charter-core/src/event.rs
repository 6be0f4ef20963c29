//! Event drafts and persisted ledger events.
//!
//! An [`EventDraft`] is built in memory. Building fixes its `event_id` and
//! the writer's `local_timestamp_ns`. Attribution is attached with
//! [`EventDraft::sign`] and [`EventDraft::witness`]. The ledger store turns
//! the draft into an immutable [`LedgerEvent`] by assigning the sequence, the
//! authority timestamp and the chain link in one transaction.
//!
//! # Signing bytes
//!
//! Writers sign [`signer_message`]:
//!
//! ```text
//! "charter-event-signature-v1\n" || canonical({agent_id, event_type, local_timestamp, payload})
//! ```
//!
//! Witnesses sign [`witness_message`], which adds the writer's `signature`
//! under the `charter-event-witness-v1` prefix. Both signatures are covered
//! by the content hash afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{CanonicalizationError, canonicalize_value, to_canonical_value};
use crate::chain::{HASH_ALG_SHA256_CANONICAL, SignableFields, compute_content_hash};
use crate::crypto::{SIG_ALG_NONE, Signer, SignerError};
use crate::time::Clock;

const SIGNER_DOMAIN: &[u8] = b"charter-event-signature-v1\n";
const WITNESS_DOMAIN: &[u8] = b"charter-event-witness-v1\n";

/// Errors raised while preparing a draft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// The payload has no canonical encoding.
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),

    /// A signer failed.
    #[error(transparent)]
    Signing(#[from] SignerError),
}

/// Bytes a writer signs for the given fields.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] if the payload cannot be encoded.
pub fn signer_message(fields: &SignableFields<'_>) -> Result<Vec<u8>, CanonicalizationError> {
    let mut body = Map::new();
    body.insert(
        "agent_id".into(),
        fields
            .agent_id
            .map_or(Value::Null, |a| Value::String(a.to_owned())),
    );
    body.insert("event_type".into(), Value::String(fields.event_type.to_owned()));
    body.insert("local_timestamp".into(), Value::from(fields.local_timestamp_ns));
    body.insert("payload".into(), fields.payload.clone());
    prefixed(SIGNER_DOMAIN, &Value::Object(body))
}

/// Bytes a witness signs for the given fields. These cover the writer's
/// signature.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] if the payload cannot be encoded.
pub fn witness_message(fields: &SignableFields<'_>) -> Result<Vec<u8>, CanonicalizationError> {
    let mut body = Map::new();
    body.insert(
        "agent_id".into(),
        fields
            .agent_id
            .map_or(Value::Null, |a| Value::String(a.to_owned())),
    );
    body.insert("event_type".into(), Value::String(fields.event_type.to_owned()));
    body.insert("local_timestamp".into(), Value::from(fields.local_timestamp_ns));
    body.insert("payload".into(), fields.payload.clone());
    body.insert(
        "signature".into(),
        fields
            .signature
            .map_or(Value::Null, |s| Value::String(hex::encode(s))),
    );
    prefixed(WITNESS_DOMAIN, &Value::Object(body))
}

fn prefixed(domain: &[u8], body: &Value) -> Result<Vec<u8>, CanonicalizationError> {
    let encoded = canonicalize_value(body)?;
    let mut message = Vec::with_capacity(domain.len() + encoded.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(&encoded);
    Ok(message)
}

/// An event proposed to the ledger but not yet committed.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub(crate) event_id: String,
    pub(crate) event_type: String,
    pub(crate) payload: Value,
    pub(crate) agent_id: Option<String>,
    pub(crate) local_timestamp_ns: u64,
    pub(crate) sig_alg_version: u16,
    pub(crate) signature: Option<Vec<u8>>,
    pub(crate) witness_id: Option<String>,
    pub(crate) witness_signature: Option<Vec<u8>>,
    pub(crate) expected_prev_hash: Option<String>,
}

impl EventDraft {
    /// Creates a draft stamped with `clock`'s current time and a fresh
    /// UUID v4 `event_id`.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value, clock: &dyn Clock) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            agent_id: None,
            local_timestamp_ns: clock.now_ns(),
            sig_alg_version: SIG_ALG_NONE,
            signature: None,
            witness_id: None,
            witness_signature: None,
            expected_prev_hash: None,
        }
    }

    /// Creates a draft from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalizationError`] if the payload contains non-finite
    /// numbers or unsupported types.
    pub fn from_serializable<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        payload: &T,
        clock: &dyn Clock,
    ) -> Result<Self, CanonicalizationError> {
        Ok(Self::new(event_type, to_canonical_value(payload)?, clock))
    }

    /// Attaches the acting agent.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Declares the tail the writer observed before appending.
    ///
    /// The store rejects the append with a chain-continuity violation if
    /// another writer has extended the chain since, so the caller can
    /// re-read the tail and retry.
    #[must_use]
    pub fn linked_to(mut self, prev_hash: impl Into<String>) -> Self {
        self.expected_prev_hash = Some(prev_hash.into());
        self
    }

    /// Signs the draft with `signer`.
    ///
    /// Any existing witness attestation is dropped, since it covered the
    /// previous signature.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the payload cannot be encoded or the signer
    /// fails.
    pub fn sign(mut self, signer: &dyn Signer) -> Result<Self, EventError> {
        let message = signer_message(&self.signable_fields())?;
        self.signature = Some(signer.sign(&message)?);
        self.sig_alg_version = signer.sig_alg_version();
        self.witness_id = None;
        self.witness_signature = None;
        Ok(self)
    }

    /// Adds a witness attestation over the signed body.
    ///
    /// `sig_alg_version` names the scheme of both signatures, so a witness
    /// must use the writer's scheme. On an unsigned draft the witness's
    /// scheme is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the payload cannot be encoded, the witness
    /// fails, or its scheme differs from the writer's.
    pub fn witness(mut self, witness: &dyn Signer) -> Result<Self, EventError> {
        let scheme = witness.sig_alg_version();
        if self.signature.is_some() && self.sig_alg_version != scheme {
            return Err(SignerError::AlgorithmMismatch {
                signer: self.sig_alg_version,
                witness: scheme,
            }
            .into());
        }
        let message = witness_message(&self.signable_fields())?;
        self.witness_signature = Some(witness.sign(&message)?);
        self.witness_id = Some(witness.key_id().to_owned());
        self.sig_alg_version = scheme;
        Ok(self)
    }

    /// Event identifier.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Writer clock at creation.
    #[must_use]
    pub const fn local_timestamp_ns(&self) -> u64 {
        self.local_timestamp_ns
    }

    /// Declared predecessor, if any.
    #[must_use]
    pub fn expected_prev_hash(&self) -> Option<&str> {
        self.expected_prev_hash.as_deref()
    }

    /// The hashed subset of this draft.
    #[must_use]
    pub fn signable_fields(&self) -> SignableFields<'_> {
        SignableFields {
            event_type: &self.event_type,
            payload: &self.payload,
            agent_id: self.agent_id.as_deref(),
            local_timestamp_ns: self.local_timestamp_ns,
            signature: self.signature.as_deref(),
            witness_id: self.witness_id.as_deref(),
            witness_signature: self.witness_signature.as_deref(),
        }
    }

    /// Content hash this draft will carry once committed.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalizationError`] if the payload cannot be encoded.
    pub fn content_hash(&self) -> Result<String, CanonicalizationError> {
        compute_content_hash(&self.signable_fields())
    }
}

/// An immutable, committed ledger event.
///
/// This is also the record shape of the read interface and of export files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEvent {
    /// Unique identifier assigned at draft creation.
    pub event_id: String,
    /// Position in the chain.
    pub sequence: u64,
    /// Event type.
    pub event_type: String,
    /// Opaque payload in canonical form.
    pub payload: Value,
    /// Acting agent.
    pub agent_id: Option<String>,
    /// Writer clock at draft creation.
    pub local_timestamp_ns: u64,
    /// Store clock at commit.
    pub authority_timestamp_ns: u64,
    /// SHA-256 of the canonical signable subset.
    pub content_hash: String,
    /// Content hash of the predecessor, or genesis.
    pub prev_hash: String,
    /// Hashing scheme version.
    pub hash_alg_version: u16,
    /// Signature scheme version.
    pub sig_alg_version: u16,
    /// Writer signature.
    #[serde(with = "hex_bytes")]
    pub signature: Option<Vec<u8>>,
    /// Witness identity.
    pub witness_id: Option<String>,
    /// Witness signature.
    #[serde(with = "hex_bytes")]
    pub witness_signature: Option<Vec<u8>>,
}

impl LedgerEvent {
    /// The hashed subset of this event.
    #[must_use]
    pub fn signable_fields(&self) -> SignableFields<'_> {
        SignableFields {
            event_type: &self.event_type,
            payload: &self.payload,
            agent_id: self.agent_id.as_deref(),
            local_timestamp_ns: self.local_timestamp_ns,
            signature: self.signature.as_deref(),
            witness_id: self.witness_id.as_deref(),
            witness_signature: self.witness_signature.as_deref(),
        }
    }

    /// Recomputes the content hash from the raw fields, ignoring the stored
    /// `content_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalizationError`] if the payload cannot be encoded.
    pub fn recompute_content_hash(&self) -> Result<String, CanonicalizationError> {
        compute_content_hash(&self.signable_fields())
    }

    /// Whether this event was hashed with the current scheme.
    #[must_use]
    pub const fn uses_current_hash_alg(&self) -> bool {
        self.hash_alg_version == HASH_ALG_SHA256_CANONICAL
    }
}

/// Serde helper for optional byte fields as lowercase hex strings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
