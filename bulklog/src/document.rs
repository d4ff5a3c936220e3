//! Documents: the immutable unit of appended data.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One appended record: an opaque JSON object body tagged with the
/// collection it belongs to and the schema it claims to follow.
///
/// Immutable after construction. The body is stored in the canonical form
/// produced by re-serializing the parsed object, so two representations of
/// the same object compare equal on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Unique identifier assigned at construction.
    pub id: Uuid,
    /// UTC time the document was posted.
    pub posted_at: DateTime<Utc>,
    /// Name of the owning collection.
    pub collection: String,
    /// Name of the schema the body follows. Consumers interpret it; the
    /// engine only carries it.
    pub schema: String,
    /// Canonical JSON object body.
    pub body: Bytes,
}

impl Document {
    /// Creates a document from a collection name, schema name and raw body.
    ///
    /// The body must parse as a JSON **object**; anything else fails with
    /// [`Error::UnparsableBody`]. The posting timestamp is recorded on the
    /// document itself, not stamped into the body.
    pub fn new(
        collection: impl Into<String>,
        schema: impl Into<String>,
        body: &[u8],
    ) -> Result<Self> {
        let body_map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(body).map_err(|_| Error::UnparsableBody)?;
        let body = serde_json::to_vec(&body_map).map_err(|_| Error::UnparsableBody)?;

        Ok(Self {
            id: Uuid::new_v4(),
            posted_at: Utc::now(),
            collection: collection.into(),
            schema: schema.into(),
            body: Bytes::from(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_create_document_from_json_object() {
        // given
        let body = br#"{"level": "info", "message": "hello"}"#;

        // when
        let doc = Document::new("audit", "v1", body).unwrap();

        // then
        assert_eq!(doc.collection, "audit");
        assert_eq!(doc.schema, "v1");
        let parsed: serde_json::Value = serde_json::from_slice(&doc.body).unwrap();
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["message"], "hello");
    }

    #[test]
    fn should_canonicalize_body_whitespace() {
        // given - same object, different spacing
        let a = Document::new("c", "s", br#"{ "k" : 1 }"#).unwrap();
        let b = Document::new("c", "s", br#"{"k":1}"#).unwrap();

        // then
        assert_eq!(a.body, b.body);
    }

    #[test]
    fn should_reject_invalid_json() {
        // when
        let result = Document::new("c", "s", b"{not json");

        // then
        assert!(matches!(result, Err(Error::UnparsableBody)));
    }

    #[test]
    fn should_reject_non_object_top_level() {
        // when
        let array = Document::new("c", "s", b"[1, 2, 3]");
        let scalar = Document::new("c", "s", b"42");

        // then
        assert!(matches!(array, Err(Error::UnparsableBody)));
        assert!(matches!(scalar, Err(Error::UnparsableBody)));
    }

    #[test]
    fn should_assign_unique_ids() {
        // given
        let a = Document::new("c", "s", b"{}").unwrap();
        let b = Document::new("c", "s", b"{}").unwrap();

        // then
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn should_not_stamp_posted_at_into_body() {
        // given
        let doc = Document::new("c", "s", br#"{"k": 1}"#).unwrap();

        // then
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&doc.body).unwrap();
        assert!(!parsed.contains_key("postedAt"));
        assert_eq!(parsed.len(), 1);
    }
}
