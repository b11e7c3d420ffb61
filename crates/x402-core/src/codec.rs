//! Canonical JSON + base64url framing for the three x402 HTTP headers.
//!
//! Per spec §4.1: each header carries one canonical-JSON object encoded with
//! base64url (no padding). Canonical JSON here means UTF-8, no embedded LF,
//! and deterministic lexicographic key order within every object — achieved
//! by round-tripping through a `BTreeMap` at every object level rather than
//! preserving `serde_json`'s insertion order.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::util::b64::Base64Bytes;

/// Canonical header names, matched case-insensitively on the wire.
pub const PAYMENT_REQUIRED: &str = "PAYMENT-REQUIRED";
pub const PAYMENT_SIGNATURE: &str = "PAYMENT-SIGNATURE";
pub const PAYMENT_RESPONSE: &str = "PAYMENT-RESPONSE";

/// Failure of the codec: bad base64, bad JSON, or schema mismatch. Carried to
/// callers as a single `MalformedHeader` outcome per spec §7.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decoded bytes are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Re-serializes a JSON value with every object's keys sorted
/// lexicographically, recursively. Numbers and strings are left untouched —
/// callers are responsible for encoding big integers as strings in their
/// `Serialize` impls (spec's bigint-safety rule).
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Serializes `v` into canonical JSON bytes: UTF-8, no trailing newline,
/// lexicographically sorted object keys, compact (no insignificant whitespace).
pub fn canonical_json<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    let raw = serde_json::to_value(v)?;
    let canonical = canonicalize(raw);
    Ok(serde_json::to_vec(&canonical)?)
}

/// Hex-encoded SHA-256 digest, used by the facilitator's verified-payload set
/// (spec §4.4) to key `sha256(canonical JSON of paymentPayload)`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// Encodes `v` as canonical JSON, base64url (no padding) — the wire value of
/// one x402 header.
pub fn encode_header<T: Serialize>(v: &T) -> Result<String, CodecError> {
    let bytes = canonical_json(v)?;
    Ok(Base64Bytes::encode(&bytes).to_string())
}

/// Decodes one x402 header value into `T`. Fails with [`CodecError`] if the
/// value is not valid base64url, not valid JSON, or does not satisfy `T`'s
/// schema — exactly the three `MalformedHeader` cases from spec §4.1.
pub fn decode_header<T: DeserializeOwned>(s: &str) -> Result<T, CodecError> {
    let bytes = Base64Bytes::from(s.as_bytes()).decode()?;
    let value: T = serde_json::from_slice(&bytes)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        zeta: String,
        alpha: u32,
        nested: Nested,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Nested {
        b: String,
        a: String,
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = Sample {
            zeta: "z".into(),
            alpha: 1,
            nested: Nested {
                b: "b".into(),
                a: "a".into(),
            },
        };
        let bytes = canonical_json(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"alpha":1,"nested":{"a":"a","b":"b"},"zeta":"z"}"#);
    }

    #[test]
    fn header_round_trips() {
        let value = Sample {
            zeta: "hello".into(),
            alpha: 42,
            nested: Nested {
                b: "two".into(),
                a: "one".into(),
            },
        };
        let encoded = encode_header(&value).unwrap();
        assert!(!encoded.contains('='), "no padding in base64url");
        let decoded: Sample = decode_header(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let result: Result<Sample, _> = decode_header("not valid base64!!!");
        assert!(result.is_err());
    }

    #[test]
    fn decode_rejects_schema_mismatch() {
        let encoded = Base64Bytes::encode(b"{\"unrelated\":true}").to_string();
        let result: Result<Sample, _> = decode_header(&encoded);
        assert!(result.is_err());
    }

    #[test]
    fn sha256_hex_is_stable() {
        let digest = sha256_hex(b"hello world");
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
        );
    }
}
