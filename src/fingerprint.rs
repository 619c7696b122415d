//! Deterministic cache keys.
//!
//! `key = SHA-256(canonical_json((source, params)))` where canonical JSON
//! sorts object keys and uses `,`/`:` separators. Two parameter maps that
//! differ only in key order fingerprint identically.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Compute the cache key for a `(source, params)` request.
///
/// Params that are not JSON objects are stringified so a fingerprint is
/// always produced.
pub fn cache_key(source: &str, params: &Value) -> String {
    let source = source.trim();
    let canonical = match params {
        Value::Object(_) => canonical_json(params),
        other => canonical_json(&Value::String(other.to_string())),
    };
    let serialized = format!("[\"{}\",{}]", escape(source), canonical);
    let digest = Sha256::digest(serialized.as_bytes());
    hex::encode(digest)
}

/// Render a JSON value with sorted object keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            out.push_str(&escape(s));
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // BTreeMap gives the stable key ordering.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(&escape(k));
                out.push_str("\":");
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// SHA-256 checksum of an arbitrary payload, used by the cache to detect
/// unchanged refresh results.
pub fn payload_checksum(payload: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(payload).as_bytes()))
}
