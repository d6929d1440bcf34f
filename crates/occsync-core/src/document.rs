//! Typed model for offline-authored occurrence documents.
//!
//! Clients write semi-structured JSON documents into their per-workstation
//! database while offline. The reconciliation engine decodes each one into
//! [`OccurrenceDocument`] exactly once at the reconciliation boundary;
//! untyped maps never reach the relational-write path.
//!
//! Optionality is explicit. Every field a client may omit has a documented
//! default (empty string for identifiers and text, zero for numeric
//! measurements), and a missing optional field is never a decode failure.

use serde::Deserialize;
use serde_json::Value;

/// Discriminator value selecting a document for reconciliation.
pub const OCCURRENCE_DOC_TYPE: &str = "occurrence";

/// Returns true if the raw document carries the occurrence discriminator.
///
/// Anything else (design documents, local markers, unrelated kinds) is a
/// silent no-op for the reconciler, not an error.
#[must_use]
pub fn is_occurrence(doc: &Value) -> bool {
    doc.get("type").and_then(Value::as_str) == Some(OCCURRENCE_DOC_TYPE)
}

/// An offline-authored occurrence document, as synchronized by clients.
///
/// The `_id` is client-assigned and carried into the relational store
/// verbatim as the durable external key; the relational side never mints
/// identities for these records.
#[derive(Debug, Clone, Deserialize)]
pub struct OccurrenceDocument {
    /// Client-assigned document identifier.
    #[serde(rename = "_id")]
    pub id: String,

    /// Owning workstation id, as a decimal string.
    #[serde(default)]
    pub workstation_id: String,

    /// Creating user id, as a decimal string.
    #[serde(default)]
    pub created_by_user_id: String,

    /// Project the record belongs to. Absent maps to empty.
    #[serde(default)]
    pub project_id: Option<String>,

    /// RFC3339 creation timestamp as written by the client.
    #[serde(default)]
    pub created_at: String,

    /// Client timezone name.
    #[serde(default)]
    pub timezone: String,

    /// Language of free-text fields. Absent maps to empty.
    #[serde(default)]
    pub language_id: Option<String>,

    /// Observation attributes.
    #[serde(default)]
    pub occurrence_data: OccurrenceData,

    /// Nested classification object.
    #[serde(default)]
    pub classification_data: ClassificationData,

    /// Nested place object.
    #[serde(default)]
    pub place_data: PlaceData,
}

impl OccurrenceDocument {
    /// Decode a raw document.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the value is structurally not an
    /// occurrence document (e.g. `_id` missing or fields of the wrong
    /// shape). Absent optional fields are not errors.
    pub fn decode(doc: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(doc.clone())
    }
}

/// Observation attributes of an occurrence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OccurrenceData {
    /// Individual identifier, default empty.
    #[serde(default)]
    pub individual_id: String,

    /// Life stage, default empty.
    #[serde(default)]
    pub lifestage: String,

    /// Sex, default empty.
    #[serde(default)]
    pub sex: String,

    /// Body length measurement. Absent maps to 0.0.
    #[serde(default)]
    pub body_length: Option<f64>,

    /// Free-text note, default empty.
    #[serde(default)]
    pub note: String,
}

/// Nested classification object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassificationData {
    /// Classification identifier; empty means "no classification attached"
    /// and skips the classification upsert.
    #[serde(default)]
    pub classification_id: String,

    /// Arbitrary classification tree, stored in its serialized JSON form.
    #[serde(default)]
    pub class_classification: Value,
}

/// Nested place object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceData {
    /// Place identifier; empty means "no place attached" and skips the
    /// place upsert.
    #[serde(default)]
    pub place_id: String,

    /// Named-place reference. Absent stays NULL.
    #[serde(default)]
    pub place_name_id: Option<String>,

    /// Coordinate object, stored in its serialized JSON form.
    #[serde(default)]
    pub coordinates: Value,

    /// Coordinate accuracy in meters. Absent maps to 0.0.
    #[serde(default)]
    pub accuracy: Option<f64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_discriminator() {
        assert!(is_occurrence(&json!({"type": "occurrence", "_id": "x"})));
        assert!(!is_occurrence(&json!({"type": "design", "_id": "x"})));
        assert!(!is_occurrence(&json!({"_id": "x"})));
    }

    #[test]
    fn test_decode_full_document() {
        let doc = json!({
            "_id": "occ-1",
            "type": "occurrence",
            "workstation_id": "3",
            "created_by_user_id": "42",
            "project_id": "proj-9",
            "created_at": "2026-05-01T09:30:00Z",
            "timezone": "Asia/Tokyo",
            "language_id": "ja",
            "occurrence_data": {
                "individual_id": "ind-7",
                "lifestage": "adult",
                "sex": "female",
                "body_length": 12.5,
                "note": "under bark"
            },
            "classification_data": {
                "classification_id": "cls-1",
                "class_classification": {"family": "Carabidae"}
            },
            "place_data": {
                "place_id": "plc-1",
                "place_name_id": "mount-a",
                "coordinates": {"lat": 35.0, "lon": 139.0},
                "accuracy": 4.0
            }
        });

        let parsed = OccurrenceDocument::decode(&doc).unwrap();
        assert_eq!(parsed.id, "occ-1");
        assert_eq!(parsed.workstation_id, "3");
        assert_eq!(parsed.project_id.as_deref(), Some("proj-9"));
        assert_eq!(parsed.occurrence_data.body_length, Some(12.5));
        assert_eq!(parsed.classification_data.classification_id, "cls-1");
        assert_eq!(parsed.place_data.place_name_id.as_deref(), Some("mount-a"));
        assert_eq!(parsed.place_data.accuracy, Some(4.0));
    }

    #[test]
    fn test_decode_minimal_document_defaults() {
        // Only the identifier; everything optional is absent.
        let doc = json!({"_id": "occ-min", "type": "occurrence"});

        let parsed = OccurrenceDocument::decode(&doc).unwrap();
        assert_eq!(parsed.id, "occ-min");
        assert!(parsed.project_id.is_none());
        assert!(parsed.language_id.is_none());
        assert_eq!(parsed.occurrence_data.body_length, None);
        assert_eq!(parsed.occurrence_data.note, "");
        assert_eq!(parsed.classification_data.classification_id, "");
        assert_eq!(parsed.place_data.place_id, "");
        assert!(parsed.place_data.accuracy.is_none());
    }

    #[test]
    fn test_decode_missing_id_is_error() {
        let doc = json!({"type": "occurrence"});
        assert!(OccurrenceDocument::decode(&doc).is_err());
    }
}
