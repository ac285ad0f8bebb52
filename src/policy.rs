//! Access-policy normalization and semantic comparison.
//!
//! A backend is free to hand a stored policy back with its object keys and
//! array elements in a different order.  Comparing the text would then report
//! drift on every read, so [`reconcile_policy`] compares policies as
//! order-independent structures and keeps the existing text whenever the two
//! documents mean the same thing.
//!
//! Equivalence rules:
//! - arrays are sets, and a scalar equals a one-element array;
//! - a statement object equals a one-element statement list;
//! - scalars compare by their text, so `true` equals `"true"`;
//! - map entries whose value is an empty list are ignored;
//! - a `"*"` principal equals `{"AWS": "*"}`.

use std::collections::{BTreeMap, BTreeSet};
use std::str::Utf8Error;

use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failures while normalizing or comparing policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The document is not valid JSON.
    #[error("policy ({raw}) is invalid JSON: {source}")]
    Parse {
        /// Offending text.
        raw: String,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// A percent escape is malformed.
    #[error("invalid URL escape {0:?}")]
    Escape(String),

    /// The decoded policy is not UTF-8.
    #[error("decoded policy is not UTF-8: {0}")]
    Utf8(#[source] Utf8Error),
}

/// Canonical serialized form of `raw`.
///
/// Blank input yields blank output.  Object keys are sorted and whitespace
/// is removed; array order is preserved.  Normalizing twice gives the same
/// result as normalizing once.
pub fn normalize(raw: &str) -> Result<String, PolicyError> {
    if raw.trim().is_empty() {
        return Ok(String::new());
    }
    let value = parse(raw)?;
    Ok(sorted(value).to_string())
}

/// The policy text to persist given the `existing` stored text and the
/// `new` desired text.
///
/// Returns the normalized existing policy when both are semantically
/// equivalent, otherwise the normalized new one.
pub fn reconcile_policy(existing: &str, new: &str) -> Result<String, PolicyError> {
    let new_normalized = normalize(new)?;
    if new_normalized.is_empty() || new_normalized == "{}" {
        return Ok(new_normalized);
    }

    let existing_normalized = normalize(existing)?;
    if existing_normalized.is_empty() || existing_normalized == "{}" {
        return Ok(new_normalized);
    }

    if equivalent(existing, new)? {
        Ok(existing_normalized)
    } else {
        Ok(new_normalized)
    }
}

/// Whether two policy documents are semantically equivalent.
pub fn equivalent(a: &str, b: &str) -> Result<bool, PolicyError> {
    let a = Semantic::of(&parse(a)?);
    let b = Semantic::of(&parse(b)?);
    Ok(a == b)
}

/// Decode a percent-encoded policy.  `+` decodes to a space and every `%`
/// must be followed by two hex digits.  The decoded bytes must be UTF-8.
pub fn unescape_policy(s: &str) -> Result<String, PolicyError> {
    let bytes = s.as_bytes();
    for (i, _) in s.match_indices('%') {
        let valid = bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
            && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
        if !valid {
            let end = (i + 3).min(bytes.len());
            return Err(PolicyError::Escape(String::from_utf8_lossy(&bytes[i..end]).into_owned()));
        }
    }
    let spaced = s.replace('+', " ");
    let decoded = percent_decode_str(&spaced).decode_utf8().map_err(PolicyError::Utf8)?;
    Ok(decoded.into_owned())
}

fn parse(raw: &str) -> Result<Value, PolicyError> {
    serde_json::from_str(raw).map_err(|source| PolicyError::Parse {
        raw: raw.to_string(),
        source,
    })
}

/// Rebuild every object with its keys in sorted order.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sorted(v))).collect();
            Value::Object(ordered.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Order-independent model of a JSON document.  Every JSON value maps to a
/// set of [`Semantic`] nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Semantic {
    Leaf(String),
    Map(BTreeMap<String, BTreeSet<Semantic>>),
}

impl Semantic {
    fn of(value: &Value) -> BTreeSet<Semantic> {
        match value {
            Value::Null => BTreeSet::new(),
            Value::Bool(b) => BTreeSet::from([Semantic::Leaf(b.to_string())]),
            Value::Number(n) => BTreeSet::from([Semantic::Leaf(n.to_string())]),
            Value::String(s) => BTreeSet::from([Semantic::Leaf(s.clone())]),
            Value::Array(items) => items.iter().flat_map(Semantic::of).collect(),
            Value::Object(map) => {
                let entries = map
                    .iter()
                    .filter_map(|(key, v)| {
                        let mut set = Semantic::of(v);
                        if is_principal_key(key) && set == star() {
                            set = BTreeSet::from([Semantic::Map(BTreeMap::from([(
                                "AWS".to_string(),
                                star(),
                            )]))]);
                        }
                        (!set.is_empty()).then(|| (key.clone(), set))
                    })
                    .collect();
                BTreeSet::from([Semantic::Map(entries)])
            }
        }
    }
}

fn is_principal_key(key: &str) -> bool {
    key == "Principal" || key == "NotPrincipal"
}

fn star() -> BTreeSet<Semantic> {
    BTreeSet::from([Semantic::Leaf("*".to_string())])
}
