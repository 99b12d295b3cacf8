//! Document identity.

use std::fmt;

use mongodb::bson::{Bson, Document, oid::ObjectId};

use crate::error::ObjectStoreError;

/// Canonical string key of a document `_id`.
///
/// The key is the canonical extended JSON of the BSON id, so an ObjectId and
/// a string that happen to look alike never share a key, and the key can be
/// turned back into the exact BSON value for refetching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn from_bson(id: &Bson) -> Self {
        Self(id.clone().into_canonical_extjson().to_string())
    }

    /// Id of a document, if it carries one.
    pub fn of(document: &Document) -> Option<Self> {
        document.get("_id").map(Self::from_bson)
    }

    /// Id for a string `_id`.
    pub fn string(id: &str) -> Self {
        Self::from_bson(&Bson::String(id.to_string()))
    }

    pub fn object_id(id: ObjectId) -> Self {
        Self::from_bson(&Bson::ObjectId(id))
    }

    /// Rebuild an id from a key previously produced by [`DocumentId::as_str`].
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The BSON value this key was built from.
    ///
    /// # Errors
    /// Returns `InvalidId` if the key is not valid extended JSON.
    pub fn to_bson(&self) -> Result<Bson, ObjectStoreError> {
        let value: serde_json::Value = serde_json::from_str(&self.0)
            .map_err(|_| ObjectStoreError::InvalidId(self.0.clone()))?;
        Bson::try_from(value).map_err(|_| ObjectStoreError::InvalidId(self.0.clone()))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_string_and_object_ids_do_not_collide() {
        let oid = ObjectId::new();
        let as_oid = DocumentId::object_id(oid);
        let as_string = DocumentId::string(&oid.to_hex());
        assert_ne!(as_oid, as_string);
    }

    #[test]
    fn test_key_round_trips_to_bson() {
        let oid = ObjectId::new();
        let id = DocumentId::object_id(oid);
        assert_eq!(DocumentId::from_key(id.as_str()).to_bson().unwrap(), Bson::ObjectId(oid));
        assert_eq!(DocumentId::string("abc").to_bson().unwrap(), Bson::String("abc".into()));
    }

    #[test]
    fn test_of_document() {
        assert_eq!(DocumentId::of(&doc! { "_id": "abc", "name": "x" }), Some(DocumentId::string("abc")));
        assert_eq!(DocumentId::of(&doc! { "name": "x" }), None);
    }

    #[test]
    fn test_invalid_key() {
        assert!(matches!(
            DocumentId::from_key("{not json").to_bson(),
            Err(ObjectStoreError::InvalidId(_))
        ));
    }
}
