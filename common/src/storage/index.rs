use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::document_chunk::{ChunkMetadata, DocumentChunk},
    },
};

/// HNSW search width. Matches the index build parameters below; raising it
/// trades latency for recall.
const KNN_EF: usize = 40;

/// The two corpora the system stores: raw document text and derived analysis
/// artifacts. Each corpus is its own table with its own vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corpus {
    Raw,
    Analysis,
}

impl Corpus {
    pub fn table(self) -> &'static str {
        match self {
            Corpus::Raw => "document_chunk",
            Corpus::Analysis => "analysis_chunk",
        }
    }

    fn index_name(self) -> &'static str {
        match self {
            Corpus::Raw => "idx_embedding_document_chunk",
            Corpus::Analysis => "idx_embedding_analysis_chunk",
        }
    }
}

impl fmt::Display for Corpus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// A chunk returned from similarity search together with its score.
/// Scores are cosine similarity in `[-1, 1]`, higher is closer.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

#[derive(Deserialize)]
struct ScoredRow {
    #[serde(deserialize_with = "super::types::document_chunk::deserialize_flexible_id")]
    id: String,
    text: String,
    metadata: ChunkMetadata,
    embedding: Vec<f32>,
    #[serde(
        deserialize_with = "super::types::document_chunk::deserialize_datetime",
        default
    )]
    created_at: DateTime<Utc>,
    distance: f32,
}

/// Append-only chunk store over one corpus table.
///
/// Concurrent readers and concurrent appenders are both fine: chunks are
/// immutable once written and nothing here updates or deletes rows, so there
/// is no row-level coordination to get wrong.
#[derive(Clone)]
pub struct VectorIndex {
    db: Arc<SurrealDbClient>,
    corpus: Corpus,
    dimension: usize,
    address: String,
}

impl VectorIndex {
    pub fn open(
        db: Arc<SurrealDbClient>,
        corpus: Corpus,
        namespace: &str,
        database: &str,
        dimension: usize,
    ) -> Self {
        let address = format!("surrealdb://{namespace}/{database}/{}", corpus.table());
        Self {
            db,
            corpus,
            dimension,
            address,
        }
    }

    pub fn corpus(&self) -> Corpus {
        self.corpus
    }

    /// Stable address of this corpus, reported in ingestion manifests.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Defines the HNSW index for this corpus if it does not exist yet.
    /// Safe to call on every startup.
    pub async fn ensure_index(&self) -> Result<(), AppError> {
        let definition = format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;",
            index = self.corpus.index_name(),
            table = self.corpus.table(),
            dimension = self.dimension,
        );

        self.db.query(definition).await?;

        Ok(())
    }

    /// Stores one batch of chunks. All-or-nothing is not promised here; the
    /// ingestion pipeline accounts for how many chunks landed before an error.
    pub async fn upsert_batch(&self, chunks: Vec<DocumentChunk>) -> Result<usize, AppError> {
        let stored = chunks.len();

        try_join_all(chunks.into_iter().map(|chunk| {
            let db = Arc::clone(&self.db);
            let table = self.corpus.table();
            async move {
                let _: Option<DocumentChunk> =
                    db.create((table, chunk.id.clone())).content(chunk).await?;
                Ok::<(), AppError>(())
            }
        }))
        .await?;

        debug!(table = self.corpus.table(), stored, "stored chunk batch");

        Ok(stored)
    }

    /// Nearest-neighbour search over this corpus. Failures map to
    /// `RetrievalUnavailable` so read sites can degrade instead of aborting.
    pub async fn search(
        &self,
        embedding: Vec<f32>,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT *, vector::distance::knn() AS distance FROM {table} \
             WHERE embedding <|{k},{ef}|> $embedding ORDER BY distance",
            table = self.corpus.table(),
            ef = KNN_EF,
        );

        let rows: Vec<ScoredRow> = self
            .db
            .query(query)
            .bind(("embedding", embedding))
            .await
            .map_err(|err| AppError::RetrievalUnavailable(err.to_string()))?
            .take(0)
            .map_err(|err| AppError::RetrievalUnavailable(err.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| RetrievedChunk {
                score: 1.0 - row.distance,
                chunk: DocumentChunk {
                    id: row.id,
                    text: row.text,
                    metadata: row.metadata,
                    embedding: row.embedding,
                    created_at: row.created_at,
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::embedding::EmbeddingProvider;
    use uuid::Uuid;

    const DIMENSION: usize = 8;

    async fn setup_index(corpus: Corpus) -> VectorIndex {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let index = VectorIndex::open(Arc::new(db), corpus, "test_ns", "test_db", DIMENSION);
        index.ensure_index().await.expect("Failed to define index");
        index
    }

    async fn chunk(provider: &EmbeddingProvider, doc_id: &str, text: &str) -> DocumentChunk {
        let embedding = provider.embed(text).await.expect("embed");
        DocumentChunk::new(text, ChunkMetadata::raw(doc_id, doc_id, None), embedding)
    }

    #[tokio::test]
    async fn search_returns_closest_chunk_first() {
        let index = setup_index(Corpus::Raw).await;
        let provider = EmbeddingProvider::new_hashed(DIMENSION);

        let near = chunk(&provider, "a.txt", "termination notice period").await;
        let far = chunk(&provider, "b.txt", "completely unrelated recipe for soup").await;
        index
            .upsert_batch(vec![near.clone(), far])
            .await
            .expect("upsert");

        let query = provider
            .embed("termination notice period")
            .await
            .expect("embed");
        let results = index.search(query, 2).await.expect("search");

        assert!(!results.is_empty());
        let top = results.first().expect("top result");
        assert_eq!(top.chunk.id, near.id);
        assert!(top.score > 0.99, "identical text should score ~1");
    }

    #[tokio::test]
    async fn upsert_reports_batch_size_and_zero_k_short_circuits() {
        let index = setup_index(Corpus::Analysis).await;
        let provider = EmbeddingProvider::new_hashed(DIMENSION);

        let stored = index
            .upsert_batch(vec![
                chunk(&provider, "a.txt", "first").await,
                chunk(&provider, "a.txt", "second").await,
            ])
            .await
            .expect("upsert");
        assert_eq!(stored, 2);

        let none = index
            .search(provider.embed("first").await.expect("embed"), 0)
            .await
            .expect("search");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn corpora_are_isolated() {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let provider = EmbeddingProvider::new_hashed(DIMENSION);

        let raw = VectorIndex::open(Arc::clone(&db), Corpus::Raw, "ns", "db", DIMENSION);
        let analysis = VectorIndex::open(Arc::clone(&db), Corpus::Analysis, "ns", "db", DIMENSION);
        raw.ensure_index().await.expect("raw index");
        analysis.ensure_index().await.expect("analysis index");

        raw.upsert_batch(vec![chunk(&provider, "a.txt", "clause text").await])
            .await
            .expect("upsert");

        let hits = analysis
            .search(provider.embed("clause text").await.expect("embed"), 4)
            .await
            .expect("search");
        assert!(hits.is_empty(), "analysis corpus must not see raw chunks");
    }
}
