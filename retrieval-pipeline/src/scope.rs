use common::storage::{index::RetrievedChunk, types::document_chunk::ChunkMetadata};
use tracing::debug;

/// Metadata keys consulted when deciding whether a chunk belongs to a
/// document, in the order they are checked. The shared index accumulates
/// chunks written by different tools, which disagree on where they record
/// provenance; this list covers the spellings seen in practice.
pub const SCOPE_METADATA_KEYS: [&str; 5] =
    ["doc_id", "source", "file_name", "source_id", "source_filename"];

/// The strings accepted as equivalent references to one logical document:
/// the identifier as given, its base filename, and the filename without
/// extension. Derived once per scoping call, used only for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIdentifierSet {
    candidates: Vec<String>,
}

impl DocIdentifierSet {
    pub fn normalize(doc_id: &str) -> Self {
        let raw = doc_id.trim();
        let base = basename(raw);
        let stem = base.rsplit_once('.').map_or(base, |(stem, _ext)| stem);

        let mut candidates = Vec::with_capacity(3);
        for candidate in [raw, base, stem] {
            if candidate.is_empty() {
                continue;
            }
            if !candidates.iter().any(|known| known == candidate) {
                candidates.push(candidate.to_owned());
            }
        }

        Self { candidates }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// True when any tracked metadata value contains any candidate as a
    /// substring. Containment rather than equality tolerates path-prefixed
    /// or otherwise decorated identifiers on either side.
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        SCOPE_METADATA_KEYS.iter().any(|key| {
            metadata
                .values_for(key)
                .iter()
                .any(|value| self.candidates.iter().any(|candidate| value.contains(candidate)))
        })
    }
}

fn basename(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw)
}

/// What `scope` produced, with the fallback disclosed rather than hidden.
#[derive(Debug, Clone)]
pub struct ScopeOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub fell_back: bool,
}

/// Narrows a chunk pool to one logical document.
///
/// Without a document identifier every chunk passes through untouched. With
/// one, chunks whose metadata matches the identifier set are kept; if nothing
/// matches, the original pool is returned unchanged with `fell_back` set so
/// the caller can attach a visible caveat. Scoping failure never blocks
/// answering and is never silent.
pub fn scope(chunks: Vec<RetrievedChunk>, doc_id: Option<&str>) -> ScopeOutcome {
    let Some(doc_id) = doc_id else {
        return ScopeOutcome {
            chunks,
            fell_back: false,
        };
    };

    let identifiers = DocIdentifierSet::normalize(doc_id);
    let matched: Vec<RetrievedChunk> = chunks
        .iter()
        .filter(|hit| identifiers.matches(&hit.chunk.metadata))
        .cloned()
        .collect();

    if matched.is_empty() {
        debug!(doc_id, pool = chunks.len(), "no chunk matched, falling back unscoped");
        return ScopeOutcome {
            chunks,
            fell_back: true,
        };
    }

    ScopeOutcome {
        chunks: matched,
        fell_back: false,
    }
}
