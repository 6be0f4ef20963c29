//! Fuzz harness for `canonicalize_json`.
//!
//! The encoder must never panic, and whatever it accepts must be a fixed
//! point: canonicalizing canonical output yields the same bytes.

#![no_main]
use charter_core::canonical::{canonicalize_json, is_canonical};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Only test valid UTF-8 strings (canonicalize_json takes &str)
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(canonical) = canonicalize_json(s) {
            let again = canonicalize_json(&canonical).expect("canonical output must re-encode");
            assert_eq!(canonical, again);
            assert!(is_canonical(&canonical));
        }
    }
});
