use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize,
};
use serde_json::Value;
use surrealdb::sql::Thing;
use uuid::Uuid;

/// Distinguishes raw document text from derived analysis artifacts that were
/// re-embedded as retrievable text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Raw,
    Analysis,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Raw => write!(f, "raw"),
            ChunkKind::Analysis => write!(f, "analysis"),
        }
    }
}

/// Provenance attached to every stored chunk.
///
/// `doc_id` is the canonical identifier assigned at ingestion (the path the
/// caller handed in). The flattened `extra` map preserves metadata written by
/// other tools into the shared index (`file_name`, `source_id`, ...), so
/// scoping can still match entries this codebase did not produce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub doc_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub kind: ChunkKind,
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, Value>,
}

impl ChunkMetadata {
    pub fn raw(doc_id: impl Into<String>, source: impl Into<String>, page: Option<u32>) -> Self {
        Self {
            doc_id: doc_id.into(),
            source: source.into(),
            page,
            kind: ChunkKind::Raw,
            extra: BTreeMap::new(),
        }
    }

    pub fn analysis(doc_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            source: source.into(),
            page: None,
            kind: ChunkKind::Analysis,
            extra: BTreeMap::new(),
        }
    }

    /// All string values recorded under `key`, whether the field is one of
    /// the typed ones or lives in the extras map (scalar or list of strings).
    pub fn values_for(&self, key: &str) -> Vec<&str> {
        match key {
            "doc_id" => vec![self.doc_id.as_str()],
            "source" => vec![self.source.as_str()],
            other => match self.extra.get(other) {
                Some(Value::String(value)) => vec![value.as_str()],
                Some(Value::Array(values)) => {
                    values.iter().filter_map(Value::as_str).collect()
                }
                _ => Vec::new(),
            },
        }
    }
}

/// A unit of stored, embeddable text. Immutable once written; the index is
/// append-only, so chunks are never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentChunk {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub created_at: DateTime<Utc>,
}

impl DocumentChunk {
    pub fn new(text: impl Into<String>, metadata: ChunkMetadata, embedding: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            metadata,
            embedding,
            created_at: Utc::now(),
        }
    }
}

// SurrealDB returns record ids as Thing values while everything else in the
// workspace treats ids as plain strings; accept both shapes on the way out.
struct FlexibleIdVisitor;

impl<'de> Visitor<'de> for FlexibleIdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string or a Thing")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value.to_string())
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value)
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok(thing.id.to_raw())
    }
}

pub(crate) fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(FlexibleIdVisitor)
}

pub(crate) fn serialize_datetime<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    Into::<surrealdb::sql::Datetime>::into(*date).serialize(serializer)
}

pub(crate) fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let dt = surrealdb::sql::Datetime::deserialize(deserializer)?;
    Ok(DateTime::<Utc>::from(dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_keys_resolve_to_their_values() {
        let metadata = ChunkMetadata::raw("uploads/lease.pdf", "lease.pdf", Some(3));

        assert_eq!(metadata.values_for("doc_id"), vec!["uploads/lease.pdf"]);
        assert_eq!(metadata.values_for("source"), vec!["lease.pdf"]);
        assert!(metadata.values_for("file_name").is_empty());
    }

    #[test]
    fn extra_keys_resolve_scalars_and_lists() {
        let mut metadata = ChunkMetadata::raw("doc-1", "doc-1.txt", None);
        metadata
            .extra
            .insert("file_name".into(), Value::String("doc-1.txt".into()));
        metadata.extra.insert(
            "source_id".into(),
            Value::Array(vec!["a".into(), "b".into()]),
        );
        metadata.extra.insert("page_count".into(), 4_u32.into());

        assert_eq!(metadata.values_for("file_name"), vec!["doc-1.txt"]);
        assert_eq!(metadata.values_for("source_id"), vec!["a", "b"]);
        // Non-string values never participate in matching.
        assert!(metadata.values_for("page_count").is_empty());
    }

    #[test]
    fn foreign_metadata_survives_a_round_trip() {
        let json = r#"{
            "doc_id": "contracts/msa.pdf",
            "source": "msa.pdf",
            "kind": "raw",
            "source_filename": "msa.pdf"
        }"#;

        let metadata: ChunkMetadata = serde_json::from_str(json).expect("deserialize");
        assert_eq!(metadata.values_for("source_filename"), vec!["msa.pdf"]);

        let back = serde_json::to_value(&metadata).expect("serialize");
        assert_eq!(
            back.get("source_filename").and_then(Value::as_str),
            Some("msa.pdf")
        );
    }
}
