//! Attribution primitives consumed by the ledger.
//!
//! The ledger treats signatures as opaque bytes that participate in the
//! content hash. Producing and checking them is delegated to two seams:
//!
//! - [`Signer`]: signs the canonical signing bytes of a draft. Writers and
//!   witnesses both implement it.
//! - [`SignatureVerifier`]: checks a signature against an externally supplied
//!   public key. The verification toolkit uses it and never asks the ledger
//!   operator for a verdict.
//!
//! [`Ed25519Signer`] and [`Ed25519Verifier`] are the reference
//! implementations (`sig_alg_version` 1). Key custody stays outside this
//! crate: an HSM-backed signer only has to implement [`Signer`].
//!
//! # Example
//!
//! ```rust
//! use charter_core::crypto::{Ed25519Signer, Ed25519Verifier, SignatureVerifier, Signer};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = Ed25519Signer::from_seed("clerk-7", [7u8; 32]);
//! let signature = signer.sign(b"message")?;
//! assert!(Ed25519Verifier.verify(&signer.public_key_bytes(), &signature, b"message"));
//! # Ok(())
//! # }
//! ```

mod sign;

pub use sign::{
    Ed25519Signer, Ed25519Verifier, PUBLIC_KEY_SIZE, SIG_ALG_ED25519, SIG_ALG_NONE,
    SIGNATURE_SIZE, SignatureVerifier, Signer, SignerError, parse_public_key_hex,
};
