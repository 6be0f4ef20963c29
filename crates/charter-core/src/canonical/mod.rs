//! Canonical JSON encoding for hashing and signing.
//!
//! Every byte that feeds a content hash or a signature passes through this
//! module. The encoding follows RFC 8785 (JCS) in spirit, with the following
//! published rules:
//!
//! - **Sorted keys**: object keys are sorted by Unicode code point order
//!   (identical to UTF-8 byte order), recursively.
//! - **No whitespace** between tokens.
//! - **Raw UTF-8**: non-ASCII characters are emitted as-is. Only `"`, `\` and
//!   U+0000..=U+001F are escaped.
//! - **NFC text**: every string and every key is normalized to Unicode NFC
//!   before emission, so visually identical strings hash identically. Two
//!   keys that collapse to the same NFC form are rejected.
//! - **Finite numbers only**: `NaN` and infinities are rejected, never
//!   coerced to `null`. Integers are emitted in plain decimal. Floats use the
//!   shortest round-trip decimal form without an exponent, and `-0.0` is
//!   emitted as `0`.
//! - **Bounded depth**: structures nested deeper than [`MAX_DEPTH`] levels
//!   are rejected.
//!
//! # Example
//!
//! ```
//! use charter_core::canonical::canonicalize_json;
//!
//! let canonical = canonicalize_json(r#"{"z": 1, "a": [true, null]}"#).unwrap();
//! assert_eq!(canonical, r#"{"a":[true,null],"z":1}"#);
//! ```

mod serializer;

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use unicode_normalization::{UnicodeNormalization, is_nfc};

pub use serializer::to_canonical_value;

/// Identifier of the canonical encoding, published alongside the genesis
/// constant so independent verifiers can pin it.
pub const CANONICALIZER_ID: &str = "charter-jcs-nfc-v1";

/// Maximum nesting depth accepted by the encoder.
pub const MAX_DEPTH: usize = 128;

/// Errors raised when a value has no deterministic encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalizationError {
    /// A `NaN` or infinite number was encountered.
    #[error("non-finite number cannot be canonicalized")]
    NonFiniteNumber,

    /// The value contains a type with no canonical JSON form (raw bytes,
    /// 128-bit integers outside the 64-bit range).
    #[error("unsupported type for canonicalization: {type_name}")]
    UnsupportedType {
        /// Name of the rejected type.
        type_name: &'static str,
    },

    /// A map key did not serialize as a string.
    #[error("map keys must be strings")]
    NonStringKey,

    /// Two keys in one object are equal after NFC normalization.
    #[error("duplicate key: '{key}' appears multiple times in object")]
    DuplicateKey {
        /// The duplicated (normalized) key.
        key: String,
    },

    /// Nesting exceeded [`MAX_DEPTH`].
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The configured depth limit.
        max_depth: usize,
    },

    /// JSON text could not be parsed.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// A `Serialize` implementation reported a custom error.
    #[error("serialization error: {message}")]
    Serialization {
        /// Message supplied by the failing implementation.
        message: String,
    },
}

/// Canonicalizes any serializable value to bytes.
///
/// The value is converted through a strict serializer that refuses to coerce
/// non-finite floats or non-string map keys, then emitted canonically.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] if the value cannot be encoded
/// deterministically.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalizationError> {
    let value = to_canonical_value(value)?;
    canonicalize_value(&value)
}

/// Canonicalizes an already-built JSON tree to bytes.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] on duplicate normalized keys or excessive
/// depth.
pub fn canonicalize_value(value: &Value) -> Result<Vec<u8>, CanonicalizationError> {
    canonical_string(value).map(String::into_bytes)
}

/// Canonicalizes an already-built JSON tree to a string.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] on duplicate normalized keys or excessive
/// depth.
pub fn canonical_string(value: &Value) -> Result<String, CanonicalizationError> {
    let mut output = String::new();
    emit_value(value, &mut output, 0)?;
    Ok(output)
}

/// Parses JSON text and returns its canonical form.
///
/// Duplicate keys in the source text are rejected rather than resolved
/// last-wins.
///
/// # Errors
///
/// Returns [`CanonicalizationError::Parse`] for invalid JSON and
/// [`CanonicalizationError::DuplicateKey`] for repeated keys.
pub fn canonicalize_json(input: &str) -> Result<String, CanonicalizationError> {
    let value = parse_with_duplicate_detection(input)?;
    canonical_string(&value)
}

/// Parses JSON text into a value, rejecting duplicate keys instead of
/// keeping the last one.
///
/// # Errors
///
/// Returns [`CanonicalizationError::Parse`] for invalid JSON and
/// [`CanonicalizationError::DuplicateKey`] for repeated keys.
pub fn parse_json_strict(input: &str) -> Result<Value, CanonicalizationError> {
    parse_with_duplicate_detection(input)
}

/// Returns `true` if `input` is already in canonical form.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    canonicalize_json(input).is_ok_and(|canonical| canonical == input)
}

/// Parses JSON while rejecting duplicate keys after escape decoding, so
/// `"a"` and `"a"` count as the same key.
fn parse_with_duplicate_detection(input: &str) -> Result<Value, CanonicalizationError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let value = ValueWithDuplicateCheck::deserialize(&mut deserializer).map_err(|e| {
        let msg = e.to_string();
        match msg.strip_prefix("duplicate key: ") {
            Some(rest) => CanonicalizationError::DuplicateKey {
                // serde_json appends " at line X column Y"
                key: rest.split(" at line ").next().unwrap_or(rest).to_string(),
            },
            None => CanonicalizationError::Parse { message: msg },
        }
    })?;
    deserializer
        .end()
        .map_err(|e| CanonicalizationError::Parse {
            message: e.to_string(),
        })?;
    Ok(value.0)
}

struct ValueWithDuplicateCheck(Value);

impl<'de> Deserialize<'de> for ValueWithDuplicateCheck {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("any valid JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| de::Error::custom("invalid float value"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(Value::String(v))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element::<ValueWithDuplicateCheck>()? {
                    vec.push(elem.0);
                }
                Ok(Value::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen_keys = BTreeSet::new();
                let mut obj = Map::new();

                while let Some(key) = map.next_key::<String>()? {
                    if !seen_keys.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate key: {key}")));
                    }
                    let value = map.next_value::<ValueWithDuplicateCheck>()?;
                    obj.insert(key, value.0);
                }
                Ok(Value::Object(obj))
            }
        }

        deserializer
            .deserialize_any(ValueVisitor)
            .map(ValueWithDuplicateCheck)
    }
}

fn emit_value(value: &Value, output: &mut String, depth: usize) -> Result<(), CanonicalizationError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalizationError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output)?,
        Value::String(s) => emit_string(&nfc(s), output),
        Value::Array(arr) => {
            output.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                emit_value(item, output, depth + 1)?;
            }
            output.push(']');
        },
        Value::Object(obj) => emit_object(obj, output, depth)?,
    }
    Ok(())
}

fn emit_number(n: &Number, output: &mut String) -> Result<(), CanonicalizationError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
    } else {
        let f = n.as_f64().ok_or(CanonicalizationError::NonFiniteNumber)?;
        if !f.is_finite() {
            return Err(CanonicalizationError::NonFiniteNumber);
        }
        // f64 Display is shortest round-trip and never uses an exponent.
        if f == 0.0 {
            output.push('0');
        } else {
            let _ = write!(output, "{f}");
        }
    }
    Ok(())
}

fn nfc(s: &str) -> Cow<'_, str> {
    if is_nfc(s) {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.nfc().collect())
    }
}

/// Minimal escaping per RFC 8785 section 3.2.2.2.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_object(
    obj: &Map<String, Value>,
    output: &mut String,
    depth: usize,
) -> Result<(), CanonicalizationError> {
    let mut entries: Vec<(Cow<'_, str>, &Value)> = obj.iter().map(|(k, v)| (nfc(k), v)).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    if let Some(pair) = entries.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(CanonicalizationError::DuplicateKey {
            key: pair[0].0.clone().into_owned(),
        });
    }

    output.push('{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(value, output, depth + 1)?;
    }
    output.push('}');
    Ok(())
}
