//! Core library for the Charter constitutional audit ledger.
//!
//! Charter records governance events in an append-only, hash-chained log
//! that outside parties can verify without trusting the operator.
//!
//! - [`canonical`]: deterministic JSON encoding used for every hash and
//!   signature.
//! - [`chain`]: content hashing, the genesis constant and link derivation.
//! - [`crypto`]: the signer and verifier seams with Ed25519 implementations.
//! - [`event`]: drafts and committed events.
//! - [`ledger`]: the `SQLite` store, its append path and paged readers.
//! - [`time`]: injected clocks and drift monitoring.
//! - [`verify`]: chain verification over any event source.
//! - [`toolkit`]: exports and the trust-nothing audit client.
//! - [`config`]: TOML configuration.

#![allow(clippy::missing_errors_doc)]

pub mod canonical;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod event;
pub mod ledger;
pub mod time;
pub mod toolkit;
pub mod verify;

pub use chain::{GENESIS_HASH, HASH_ALG_SHA256_CANONICAL};
pub use event::{EventDraft, LedgerEvent};
pub use ledger::{Ledger, LedgerError};
pub use verify::{ChainVerifier, VerificationReport};
