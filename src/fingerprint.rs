//! Query fingerprints.
//!
//! A fingerprint is a SHA-256 digest over the operation prefix, the
//! collection name, the filter and the query options. Object keys are
//! written in sorted order before hashing, so two filters that only differ
//! in field insertion order share a fingerprint. Array order is kept.

use std::fmt;

use mongodb::bson::{Bson, Document};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::database::SequenceToken;

/// Prefix for multi-document queries.
pub const FIND: &str = "find";
/// Prefix for single-document queries.
pub const FIND_ONE: &str = "find-one";
/// Prefix for collection counts.
pub const COLLECTION_SIZE: &str = "collection-size";

/// Hex digest identifying a query shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a query.
    ///
    /// # Errors
    /// Returns an error if `options` cannot be serialized.
    pub fn compute<O>(
        prefix: &str,
        collection: &str,
        filter: &Document,
        options: Option<&O>,
    ) -> Result<Self, serde_json::Error>
    where
        O: Serialize + ?Sized,
    {
        let filter = Bson::Document(filter.clone()).into_canonical_extjson();
        let options = match options {
            Some(options) => serde_json::to_value(options)?,
            None => Value::Null,
        };

        let mut hasher = Sha256::new();
        for part in [
            prefix.to_string(),
            collection.to_string(),
            canonical_json(&filter),
            canonical_json(&options),
        ] {
            hasher.update(part.as_bytes());
            // NUL separator keeps ("ab", "c") apart from ("a", "bc")
            hasher.update([0u8]);
        }

        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotency key for a change event, derived from its sequence token.
pub fn idempotency_key(collection: &str, token: &SequenceToken) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(token.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with object keys in sorted order.
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::QueryOptions;
    use mongodb::bson::doc;
    use proptest::prelude::*;

    fn find(collection: &str, filter: &Document) -> Fingerprint {
        Fingerprint::compute(FIND, collection, filter, Some(&QueryOptions::default())).unwrap()
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a = doc! { "status": "live", "owner": "u1", "meta": { "x": 1, "y": 2 } };
        let b = doc! { "meta": { "y": 2, "x": 1 }, "owner": "u1", "status": "live" };
        assert_eq!(find("emotes", &a), find("emotes", &b));
    }

    #[test]
    fn test_prefix_and_collection_participate() {
        let filter = doc! { "status": "live" };
        let options = QueryOptions::default();
        let as_find = Fingerprint::compute(FIND, "emotes", &filter, Some(&options)).unwrap();
        let as_one = Fingerprint::compute(FIND_ONE, "emotes", &filter, Some(&options)).unwrap();
        assert_ne!(as_find, as_one);
        assert_ne!(find("emotes", &filter), find("users", &filter));
    }

    #[test]
    fn test_sort_order_participates() {
        let filter = doc! {};
        let by_name = QueryOptions::default().sort_asc("name").sort_desc("created_at");
        let by_date = QueryOptions::default().sort_desc("created_at").sort_asc("name");
        let a = Fingerprint::compute(FIND, "emotes", &filter, Some(&by_name)).unwrap();
        let b = Fingerprint::compute(FIND, "emotes", &filter, Some(&by_date)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = find("emotes", &doc! {});
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let token = SequenceToken::new("42");
        assert_eq!(idempotency_key("emotes", &token), idempotency_key("emotes", &token));
        assert_ne!(idempotency_key("emotes", &token), idempotency_key("users", &token));
    }

    proptest! {
        #[test]
        fn prop_reordered_filters_share_fingerprint(
            fields in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 1..12)
        ) {
            let mut forward = Document::new();
            for (key, value) in fields.iter() {
                forward.insert(key.clone(), *value);
            }
            let mut reversed = Document::new();
            for (key, value) in fields.iter().rev() {
                reversed.insert(key.clone(), *value);
            }
            prop_assert_eq!(find("emotes", &forward), find("emotes", &reversed));
        }

        #[test]
        fn prop_different_values_differ(
            key in "[a-z]{1,8}",
            a in any::<i64>(),
            b in any::<i64>(),
        ) {
            prop_assume!(a != b);
            let mut left = Document::new();
            left.insert(key.clone(), a);
            let mut right = Document::new();
            right.insert(key, b);
            prop_assert_ne!(find("emotes", &left), find("emotes", &right));
        }
    }
}
