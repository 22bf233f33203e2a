//! Board records and their canonical JSON form.
//!
//! A record is the unit the canvas renders and the unit the sync engine
//! replicates. Positional fields are typed; everything else a tool needs
//! (colors, text, geometry, arrow endpoints) lives in the open `props` map,
//! and application annotations live in `meta`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier of a record within one board.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id prefixed with the record kind, e.g. `drawable:4f0c…`.
    pub fn generate(kind: RecordKind) -> Self {
        Self(format!("{}:{}", kind.as_str(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Closed set of record kinds known to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Shapes, strokes, sticky notes, text.
    Drawable,
    /// Uploaded images and files referenced by drawables.
    Attachment,
    /// Connections between drawables (arrows bound to shapes).
    Relation,
    /// Per-user viewport.
    Camera,
    /// Per-user selection state.
    Selection,
    /// Per-user pointer.
    Pointer,
    /// Per-user editor instance state.
    Instance,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Drawable,
        RecordKind::Attachment,
        RecordKind::Relation,
        RecordKind::Camera,
        RecordKind::Selection,
        RecordKind::Pointer,
        RecordKind::Instance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Drawable => "drawable",
            RecordKind::Attachment => "attachment",
            RecordKind::Relation => "relation",
            RecordKind::Camera => "camera",
            RecordKind::Selection => "selection",
            RecordKind::Pointer => "pointer",
            RecordKind::Instance => "instance",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while converting records to or from canonical JSON.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record id is empty")]
    EmptyId,
    #[error("record {id}: field `{field}` is not a finite number")]
    NonFinite { id: RecordId, field: &'static str },
    #[error("record json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single addressable board entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RecordId>,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, kind: RecordKind) -> Self {
        Self {
            id: id.into(),
            kind,
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            parent: None,
            props: Map::new(),
            meta: Map::new(),
        }
    }

    /// Drawable at a document position.
    pub fn drawable(id: impl Into<RecordId>, x: f64, y: f64) -> Self {
        Self::new(id, RecordKind::Drawable).at(x, y)
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<RecordId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Serialize to the JSON-safe form stored in the replicated document.
    ///
    /// The output owns no references into `self`; decoding it yields a record
    /// equal to the original.
    pub fn to_canonical_json(&self) -> Result<String, RecordError> {
        if self.id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        for (field, value) in [("x", self.x), ("y", self.y), ("rotation", self.rotation)] {
            if !value.is_finite() {
                return Err(RecordError::NonFinite {
                    id: self.id.clone(),
                    field,
                });
            }
        }
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_canonical_json(json: &str) -> Result<Self, RecordError> {
        let record: Record = serde_json::from_str(json)?;
        if record.id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_drawable() {
        let record =
            Record::from_canonical_json(r#"{"id":"s1","kind":"drawable","x":10,"y":20}"#).unwrap();
        assert_eq!(record.id.as_str(), "s1");
        assert_eq!(record.kind, RecordKind::Drawable);
        assert_eq!(record.x, 10.0);
        assert_eq!(record.y, 20.0);
        assert!(record.props.is_empty());
        assert!(record.parent.is_none());
    }

    #[test]
    fn test_canonical_json_is_lossless_for_nested_payloads() {
        let record = Record::drawable("s1", 10.5, -3.25)
            .with_parent("frame:1")
            .with_prop("color", "red")
            .with_prop("points", json!([[0, 0], [4.5, 2], [8, -1.5]]))
            .with_prop("style", json!({ "dash": "dotted", "size": { "w": 120, "h": 80 } }))
            .with_prop("locked", false)
            .with_prop("label", json!(null))
            .with_meta("createdBy", "alice");

        let json = record.to_canonical_json().unwrap();
        let decoded = Record::from_canonical_json(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_non_finite_position_rejected() {
        let record = Record::drawable("s1", f64::NAN, 0.0);
        match record.to_canonical_json() {
            Err(RecordError::NonFinite { field, .. }) => assert_eq!(field, "x"),
            other => panic!("expected NonFinite, got {other:?}"),
        }

        let mut record = Record::drawable("s2", 0.0, 0.0);
        record.rotation = f64::INFINITY;
        assert!(record.to_canonical_json().is_err());
    }

    #[test]
    fn test_empty_id_rejected() {
        let record = Record::drawable("", 1.0, 1.0);
        assert!(matches!(record.to_canonical_json(), Err(RecordError::EmptyId)));
        assert!(Record::from_canonical_json(r#"{"id":"","kind":"drawable"}"#).is_err());
    }

    #[test]
    fn test_unknown_kind_is_a_decode_error() {
        let err = Record::from_canonical_json(r#"{"id":"x","kind":"hologram"}"#).unwrap_err();
        assert!(matches!(err, RecordError::Json(_)));
    }

    #[test]
    fn test_generated_ids_carry_kind_prefix() {
        let a = RecordId::generate(RecordKind::Relation);
        let b = RecordId::generate(RecordKind::Relation);
        assert!(a.as_str().starts_with("relation:"));
        assert_ne!(a, b);
    }
}
