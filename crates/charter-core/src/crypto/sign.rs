//! Signer and verifier seams with Ed25519 implementations.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

/// `sig_alg_version` of an unsigned event.
pub const SIG_ALG_NONE: u16 = 0;

/// `sig_alg_version` for Ed25519 signatures.
pub const SIG_ALG_ED25519: u16 = 1;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors from signing collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignerError {
    /// Key material could not be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The backing signer refused or failed to sign.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// Writer and witness sign with different schemes. An event records
    /// a single `sig_alg_version` for both.
    #[error("witness scheme {witness} differs from writer scheme {signer}")]
    AlgorithmMismatch {
        /// Scheme of the writer signature.
        signer: u16,
        /// Scheme of the witness.
        witness: u16,
    },
}

/// Produces attribution signatures over canonical signing bytes.
pub trait Signer: Send + Sync {
    /// Identity recorded with the signature (agent or witness id).
    fn key_id(&self) -> &str;

    /// Algorithm version stamped into `sig_alg_version`.
    fn sig_alg_version(&self) -> u16;

    /// Signs `message`.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] if the backing key cannot sign.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError>;
}

/// Verifies signatures against externally supplied public keys.
pub trait SignatureVerifier: Send + Sync {
    /// Algorithm version this verifier understands.
    fn sig_alg_version(&self) -> u16;

    /// Returns `true` only if `signature` is a valid signature of `message`
    /// under `public_key`. Malformed keys or signatures are `false`.
    fn verify(&self, public_key: &[u8], signature: &[u8], message: &[u8]) -> bool;
}

/// In-process Ed25519 signer.
pub struct Ed25519Signer {
    key_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("key_id", &self.key_id)
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

impl Ed25519Signer {
    /// Wraps an existing signing key.
    #[must_use]
    pub fn new(key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key,
        }
    }

    /// Builds a signer from a 32-byte seed.
    #[must_use]
    pub fn from_seed(key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        Self::new(key_id, SigningKey::from_bytes(&seed))
    }

    /// Builds a signer from a hex-encoded 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::InvalidKey`] if the seed is not 64 hex digits.
    pub fn from_seed_hex(key_id: impl Into<String>, seed_hex: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| SignerError::InvalidKey(format!("seed is not hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(key_id, seed))
    }

    /// Raw public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex-encoded public key, the form used in trusted key files.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sig_alg_version(&self) -> u16 {
        SIG_ALG_ED25519
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        use ed25519_dalek::Signer as _;
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

/// Strict Ed25519 verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn sig_alg_version(&self) -> u16 {
        SIG_ALG_ED25519
    }

    fn verify(&self, public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(message, &signature).is_ok()
    }
}

/// Parses a hex-encoded Ed25519 public key.
///
/// # Errors
///
/// Returns [`SignerError::InvalidKey`] if the value is not a valid 32-byte
/// curve point.
pub fn parse_public_key_hex(value: &str) -> Result<[u8; PUBLIC_KEY_SIZE], SignerError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| SignerError::InvalidKey(format!("public key is not hex: {e}")))?;
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| SignerError::InvalidKey("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SignerError::InvalidKey(format!("not an Ed25519 point: {e}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::new("clerk-1", SigningKey::generate(&mut OsRng));
        let signature = signer.sign(b"charter").unwrap();

        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert_eq!(signer.sig_alg_version(), SIG_ALG_ED25519);
        assert!(Ed25519Verifier.verify(&signer.public_key_bytes(), &signature, b"charter"));
    }

    #[test]
    fn test_verify_rejects_wrong_message_and_key() {
        let signer = Ed25519Signer::from_seed("a", [1u8; 32]);
        let other = Ed25519Signer::from_seed("b", [2u8; 32]);
        let signature = signer.sign(b"charter").unwrap();

        assert!(!Ed25519Verifier.verify(&signer.public_key_bytes(), &signature, b"charteR"));
        assert!(!Ed25519Verifier.verify(&other.public_key_bytes(), &signature, b"charter"));
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        let signer = Ed25519Signer::from_seed("a", [1u8; 32]);
        let signature = signer.sign(b"m").unwrap();

        assert!(!Ed25519Verifier.verify(&[0u8; 5], &signature, b"m"));
        assert!(!Ed25519Verifier.verify(&signer.public_key_bytes(), &signature[..10], b"m"));
    }

    #[test]
    fn test_seed_hex_round_trip() {
        let seed_hex = hex::encode([9u8; 32]);
        let signer = Ed25519Signer::from_seed_hex("k", &seed_hex).unwrap();
        assert_eq!(
            signer.public_key_bytes(),
            Ed25519Signer::from_seed("k", [9u8; 32]).public_key_bytes()
        );
        assert_eq!(
            parse_public_key_hex(&signer.public_key_hex()).unwrap(),
            signer.public_key_bytes()
        );

        assert!(Ed25519Signer::from_seed_hex("k", "zz").is_err());
        assert!(Ed25519Signer::from_seed_hex("k", "abcd").is_err());
    }

    #[test]
    fn test_debug_does_not_print_secret() {
        let signer = Ed25519Signer::from_seed("k", [3u8; 32]);
        let rendered = format!("{signer:?}");
        assert!(!rendered.contains(&hex::encode([3u8; 32])));
    }
}
