//! Independent verification toolkit.
//!
//! An auditor needs three things to check a ledger: an [`EventSource`]
//! (a live read-only connection or an [`ExportFile`]), the published hashing
//! and signing rules in this crate, and a set of [`TrustedKeys`] obtained
//! out of band. Nothing the operator says about its own integrity is
//! consulted.
//!
//! [`AuditClient::audit`] walks the range with [`ChainVerifier`] and checks
//! every writer and witness signature in the same pass. The
//! [`AuditPolicy`] then decides whether the audit passes.
//!
//! # Example
//!
//! ```rust,no_run
//! use charter_core::toolkit::{AuditClient, ExportFile, TrustedKeys};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = TrustedKeys::from_file(std::path::Path::new("keys.toml"))?;
//! let export = ExportFile::open("ledger.jsonl")?;
//!
//! let report = AuditClient::new(keys).audit(&export, 1, u64::MAX)?;
//! if !report.passed {
//!     for failure in &report.failures {
//!         eprintln!("{failure}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod export;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use self::export::{ExportError, ExportFile, ExportHeader, export_range, export_range_paged};
use crate::crypto::{
    Ed25519Verifier, PUBLIC_KEY_SIZE, SignatureVerifier, parse_public_key_hex,
};
use crate::event::{LedgerEvent, signer_message, witness_message};
pub use crate::ledger::{EventPage, EventSource};
use crate::verify::{ChainVerifier, VerificationReport, VerifyError};

/// Errors that stop an audit or key loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// The chain walk failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The key file could not be read.
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),

    /// The key file is not valid TOML.
    #[error("failed to parse key file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The key file could not be written.
    #[error("failed to serialize key file: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A key entry is invalid.
    #[error("invalid key {id:?}: {reason}")]
    InvalidKey {
        /// Key identity.
        id: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Outcome of checking one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The signature verifies under the trusted key.
    Valid,
    /// The signature does not verify.
    Invalid,
    /// No trusted key is known for the claimed identity.
    UnknownKey,
    /// The event carries no such signature.
    Absent,
    /// The signature scheme is not supported.
    UnsupportedAlgorithm,
}

/// Signature verdicts for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureVerdict {
    /// Event sequence.
    pub sequence: u64,
    /// Writer signature.
    pub signer: Verdict,
    /// Witness signature.
    pub witness: Verdict,
}

/// Pass/fail rules applied on top of the raw findings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPolicy {
    /// Sequence gaps do not fail the audit.
    pub allow_gaps: bool,
    /// Every event needs a valid writer signature.
    pub require_signatures: bool,
}

/// Result of an audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Chain walk findings.
    pub chain: VerificationReport,
    /// Per-event signature verdicts in walk order.
    pub signatures: Vec<SignatureVerdict>,
    /// Policy the report was judged under.
    pub policy: AuditPolicy,
    /// Whether the audit passed.
    pub passed: bool,
    /// Human-readable reasons the audit failed.
    pub failures: Vec<String>,
}

impl AuditReport {
    fn judge(chain: VerificationReport, signatures: Vec<SignatureVerdict>, policy: AuditPolicy) -> Self {
        let mut failures = Vec::new();

        if let Some(first_break) = &chain.first_break {
            failures.push(format!(
                "chain break ({:?}) at sequence {}",
                first_break.kind, first_break.sequence
            ));
        }
        if !policy.allow_gaps {
            for gap in &chain.gaps {
                failures.push(format!("sequence gap {}..={}", gap.start, gap.end));
            }
        }
        for verdict in &signatures {
            if verdict.signer == Verdict::Invalid {
                failures.push(format!("invalid writer signature at sequence {}", verdict.sequence));
            } else if policy.require_signatures && verdict.signer != Verdict::Valid {
                failures.push(format!(
                    "writer signature {:?} at sequence {}",
                    verdict.signer, verdict.sequence
                ));
            }
            if verdict.witness == Verdict::Invalid {
                failures.push(format!("invalid witness signature at sequence {}", verdict.sequence));
            }
        }

        Self {
            passed: failures.is_empty(),
            chain,
            signatures,
            policy,
            failures,
        }
    }

    /// Number of verdicts of the given kind across writer signatures.
    #[must_use]
    pub fn count_signer(&self, verdict: Verdict) -> usize {
        self.signatures.iter().filter(|v| v.signer == verdict).count()
    }

    /// Number of verdicts of the given kind across witness signatures.
    #[must_use]
    pub fn count_witness(&self, verdict: Verdict) -> usize {
        self.signatures.iter().filter(|v| v.witness == verdict).count()
    }
}

/// Public keys trusted by an auditor.
///
/// Loaded from a TOML file obtained independently of the ledger operator:
///
/// ```toml
/// default_signer = "clerk-1"
///
/// [signers]
/// clerk-1 = "<64 hex chars>"
///
/// [witnesses]
/// witness-1 = "<64 hex chars>"
/// ```
///
/// `default_signer` names the key used for events without an `agent_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedKeys {
    signers: BTreeMap<String, [u8; PUBLIC_KEY_SIZE]>,
    witnesses: BTreeMap<String, [u8; PUBLIC_KEY_SIZE]>,
    default_signer: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrustedKeysFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_signer: Option<String>,
    #[serde(default)]
    signers: BTreeMap<String, String>,
    #[serde(default)]
    witnesses: BTreeMap<String, String>,
}

impl TrustedKeys {
    /// An empty key set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts `public_key` for writer `id`.
    #[must_use]
    pub fn with_signer(mut self, id: impl Into<String>, public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        self.signers.insert(id.into(), public_key);
        self
    }

    /// Trusts `public_key` for witness `id`.
    #[must_use]
    pub fn with_witness(mut self, id: impl Into<String>, public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        self.witnesses.insert(id.into(), public_key);
        self
    }

    /// Uses writer `id` for events without an `agent_id`.
    #[must_use]
    pub fn with_default_signer(mut self, id: impl Into<String>) -> Self {
        self.default_signer = Some(id.into());
        self
    }

    /// Loads a key file.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, AuditError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses a key file.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::InvalidKey`] for a malformed public key or a
    /// `default_signer` that is not listed under `[signers]`.
    pub fn from_toml(content: &str) -> Result<Self, AuditError> {
        let file: TrustedKeysFile = toml::from_str(content)?;

        let parse = |entries: BTreeMap<String, String>| {
            entries
                .into_iter()
                .map(|(id, hex)| match parse_public_key_hex(&hex) {
                    Ok(key) => Ok((id, key)),
                    Err(e) => Err(AuditError::InvalidKey {
                        id,
                        reason: e.to_string(),
                    }),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
        };
        let keys = Self {
            signers: parse(file.signers)?,
            witnesses: parse(file.witnesses)?,
            default_signer: file.default_signer,
        };

        if let Some(default) = &keys.default_signer {
            if !keys.signers.contains_key(default) {
                return Err(AuditError::InvalidKey {
                    id: default.clone(),
                    reason: "default_signer is not listed under [signers]".to_string(),
                });
            }
        }
        Ok(keys)
    }

    /// Renders the key set as a key file.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialize`] if encoding fails.
    pub fn to_toml(&self) -> Result<String, AuditError> {
        let file = TrustedKeysFile {
            default_signer: self.default_signer.clone(),
            signers: self
                .signers
                .iter()
                .map(|(id, key)| (id.clone(), hex::encode(key)))
                .collect(),
            witnesses: self
                .witnesses
                .iter()
                .map(|(id, key)| (id.clone(), hex::encode(key)))
                .collect(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Key for a writer, falling back to the default signer.
    #[must_use]
    pub fn signer_key(&self, agent_id: Option<&str>) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        let id = agent_id.or(self.default_signer.as_deref())?;
        self.signers.get(id)
    }

    /// Key for a witness.
    #[must_use]
    pub fn witness_key(&self, witness_id: &str) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.witnesses.get(witness_id)
    }
}

/// Trust-nothing auditor over any [`EventSource`].
pub struct AuditClient {
    keys: TrustedKeys,
    policy: AuditPolicy,
    chain: ChainVerifier,
    verifier: Box<dyn SignatureVerifier>,
}

impl std::fmt::Debug for AuditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditClient")
            .field("keys", &self.keys)
            .field("policy", &self.policy)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl AuditClient {
    /// Auditor with the default policy and Ed25519 verification.
    #[must_use]
    pub fn new(keys: TrustedKeys) -> Self {
        Self {
            keys,
            policy: AuditPolicy::default(),
            chain: ChainVerifier::new(),
            verifier: Box::new(Ed25519Verifier),
        }
    }

    /// Replaces the pass/fail policy.
    #[must_use]
    pub fn with_policy(mut self, policy: AuditPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the page size of the chain walk.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.chain = self.chain.with_page_size(page_size);
        self
    }

    /// Replaces the signature verifier.
    #[must_use]
    pub fn with_signature_verifier(mut self, verifier: Box<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Audits `start..=end` of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Verify`] if the range is inverted or the source
    /// fails. Integrity findings are reported, not returned as errors.
    pub fn audit<S>(&self, source: &S, start: u64, end: u64) -> Result<AuditReport, AuditError>
    where
        S: EventSource + ?Sized,
    {
        let mut signatures = Vec::new();
        let chain = self
            .chain
            .verify_range_with(source, start, end, |event| {
                signatures.push(self.check_signatures(event));
            })?;

        let report = AuditReport::judge(chain, signatures, self.policy);
        if report.passed {
            info!(events = report.chain.events_checked, "audit passed");
        } else {
            warn!(
                events = report.chain.events_checked,
                failures = report.failures.len(),
                "audit failed"
            );
        }
        Ok(report)
    }

    /// Verdicts for a single event.
    #[must_use]
    pub fn check_signatures(&self, event: &LedgerEvent) -> SignatureVerdict {
        SignatureVerdict {
            sequence: event.sequence,
            signer: self.signer_verdict(event),
            witness: self.witness_verdict(event),
        }
    }

    fn signer_verdict(&self, event: &LedgerEvent) -> Verdict {
        let Some(signature) = event.signature.as_deref() else {
            return Verdict::Absent;
        };
        if !self.scheme_supported(event) {
            return Verdict::UnsupportedAlgorithm;
        }
        let Some(key) = self.keys.signer_key(event.agent_id.as_deref()) else {
            return Verdict::UnknownKey;
        };
        match signer_message(&event.signable_fields()) {
            Ok(message) if self.verifier.verify(key, signature, &message) => Verdict::Valid,
            _ => Verdict::Invalid,
        }
    }

    /// Writer and witness sign with the scheme in `sig_alg_version`.
    fn scheme_supported(&self, event: &LedgerEvent) -> bool {
        event.sig_alg_version == self.verifier.sig_alg_version()
    }

    fn witness_verdict(&self, event: &LedgerEvent) -> Verdict {
        let Some(signature) = event.witness_signature.as_deref() else {
            return Verdict::Absent;
        };
        if !self.scheme_supported(event) {
            return Verdict::UnsupportedAlgorithm;
        }
        let Some(key) = event
            .witness_id
            .as_deref()
            .and_then(|id| self.keys.witness_key(id))
        else {
            return Verdict::UnknownKey;
        };
        match witness_message(&event.signable_fields()) {
            Ok(message) if self.verifier.verify(key, signature, &message) => Verdict::Valid,
            _ => Verdict::Invalid,
        }
    }
}
