//! JSON form of documents held in the object cache.
//!
//! Documents are stored as canonical extended JSON so every BSON type
//! survives the trip through the keyed store unchanged.

use mongodb::bson::{Bson, Document};

use crate::error::KeyedStoreError;

pub fn encode_document(document: &Document) -> String {
    Bson::Document(document.clone()).into_canonical_extjson().to_string()
}

/// # Errors
/// Returns `Protocol` if the stored value is not a JSON document.
pub fn decode_document(json: &str) -> Result<Document, KeyedStoreError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|err| KeyedStoreError::Protocol(format!("cached object is not JSON: {}", err)))?;
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(KeyedStoreError::Protocol(format!(
            "cached object is a {:?}, not a document",
            other.element_type()
        ))),
        Err(err) => Err(KeyedStoreError::Protocol(format!("cached object is not extended JSON: {}", err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{DateTime, doc, oid::ObjectId};

    #[test]
    fn test_types_survive() {
        let document = doc! {
            "_id": ObjectId::new(),
            "count": 3_i32,
            "big": 3_i64,
            "created_at": DateTime::from_millis(1_700_000_000_000),
        };
        let decoded = decode_document(&encode_document(&document)).unwrap();
        assert_eq!(decoded, document);
    }

    #[test]
    fn test_non_document_is_protocol_error() {
        assert!(matches!(decode_document("[1,2]"), Err(KeyedStoreError::Protocol(_))));
        assert!(matches!(decode_document("nope"), Err(KeyedStoreError::Protocol(_))));
    }
}
