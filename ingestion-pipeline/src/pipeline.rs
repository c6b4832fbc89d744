use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        index::VectorIndex,
        types::document_chunk::{ChunkMetadata, DocumentChunk},
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    chunker::prepare_chunks,
    loader::{DocumentLoader, TextSegment},
};

/// Result of a successful ingestion, returned to the caller. Reports and
/// further processing start from here; nothing else is persisted for them.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionManifest {
    pub file_name: String,
    pub num_chunks: usize,
    pub vector_db_path: String,
    pub extracted_text: String,
}

/// Knobs for one pipeline instance. Defaults mirror the configuration
/// defaults so tests can build tuning directly.
#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub batch_size: usize,
    pub step_timeout: Duration,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            batch_size: 100,
            step_timeout: Duration::from_secs(60),
        }
    }
}

impl IngestionTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            batch_size: config.ingest_batch_size.max(1),
            step_timeout: Duration::from_secs(config.ingest_step_timeout_secs),
        }
    }
}

/// External collaborators of the ingestion pipeline, behind one seam so tests
/// can exercise the driver without disk, models, or a database.
#[async_trait]
pub trait IngestionServices: Send + Sync {
    async fn load_document(&self, path: &Path) -> Result<Vec<TextSegment>, AppError>;

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;

    async fn store_batch(&self, chunks: Vec<DocumentChunk>) -> Result<usize, AppError>;

    fn index_address(&self) -> String;
}

pub struct DefaultIngestionServices {
    loader: Arc<dyn DocumentLoader>,
    embedding_provider: Arc<EmbeddingProvider>,
    index: VectorIndex,
}

impl DefaultIngestionServices {
    pub fn new(
        loader: Arc<dyn DocumentLoader>,
        embedding_provider: Arc<EmbeddingProvider>,
        index: VectorIndex,
    ) -> Self {
        Self {
            loader,
            embedding_provider,
            index,
        }
    }
}

#[async_trait]
impl IngestionServices for DefaultIngestionServices {
    async fn load_document(&self, path: &Path) -> Result<Vec<TextSegment>, AppError> {
        self.loader.load(path).await
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedding_provider.embed_batch(texts).await
    }

    async fn store_batch(&self, chunks: Vec<DocumentChunk>) -> Result<usize, AppError> {
        self.index.upsert_batch(chunks).await
    }

    fn index_address(&self) -> String {
        self.index.address().to_owned()
    }
}

/// Drives loader -> chunker -> vector index for one document.
#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    services: Arc<dyn IngestionServices>,
    tuning: IngestionTuning,
}

impl IngestionPipeline {
    pub fn new(
        loader: Arc<dyn DocumentLoader>,
        embedding_provider: Arc<EmbeddingProvider>,
        index: VectorIndex,
        tuning: IngestionTuning,
    ) -> Self {
        let services = DefaultIngestionServices::new(loader, embedding_provider, index);
        Self::with_services(Arc::new(services), tuning)
    }

    pub fn with_services(services: Arc<dyn IngestionServices>, tuning: IngestionTuning) -> Self {
        Self { services, tuning }
    }

    /// Ingests one document and reports what was stored.
    ///
    /// The document id carried on every chunk is the path string exactly as
    /// given, so later scoping can match it back. Batches are written
    /// sequentially; a failed batch surfaces as `PartialIngestion` with the
    /// number of chunks already persisted (the index is append-only, so those
    /// stay useful for retrieval even when the document is incomplete).
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub async fn ingest(&self, path: &Path) -> Result<IngestionManifest, AppError> {
        match tokio::fs::metadata(path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }

        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let segments = timeout(self.tuning.step_timeout, self.services.load_document(path))
            .await
            .map_err(|_| {
                AppError::InternalError(format!(
                    "document loading timed out after {}s",
                    self.tuning.step_timeout.as_secs()
                ))
            })??;
        let load_duration = stage_start.elapsed();

        let extracted_text = join_segments(&segments);
        if extracted_text.trim().is_empty() {
            return Err(AppError::EmptyDocument(path.display().to_string()));
        }

        let doc_id = path.display().to_string();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| doc_id.clone());

        let stage_start = Instant::now();
        let chunks = prepare_chunks(&segments, self.tuning.chunk_size, self.tuning.chunk_overlap)?;
        let chunk_duration = stage_start.elapsed();

        if chunks.is_empty() {
            return Err(AppError::EmptyDocument(path.display().to_string()));
        }

        let stage_start = Instant::now();
        let stored = self.store_chunks(&doc_id, chunks).await?;
        let store_duration = stage_start.elapsed();

        info!(
            num_chunks = stored,
            total_ms = duration_millis(pipeline_started.elapsed()),
            load_ms = duration_millis(load_duration),
            chunk_ms = duration_millis(chunk_duration),
            store_ms = duration_millis(store_duration),
            "document ingestion finished"
        );

        Ok(IngestionManifest {
            file_name,
            num_chunks: stored,
            vector_db_path: self.services.index_address(),
            extracted_text,
        })
    }

    /// Embeds and stores chunks in sequential bounded batches, accounting for
    /// how many landed before any failure.
    async fn store_chunks(
        &self,
        doc_id: &str,
        chunks: Vec<crate::chunker::PreparedChunk>,
    ) -> Result<usize, AppError> {
        let total = chunks.len();
        let mut stored = 0_usize;

        for batch in chunks.chunks(self.tuning.batch_size) {
            let outcome = timeout(self.tuning.step_timeout, self.store_batch(doc_id, batch)).await;

            let batch_stored = match outcome {
                Ok(Ok(count)) => count,
                Ok(Err(err)) => {
                    warn!(stored, total, error = %err, "chunk batch failed");
                    return Err(AppError::PartialIngestion { stored, total });
                }
                Err(_) => {
                    warn!(
                        stored,
                        total,
                        timeout_secs = self.tuning.step_timeout.as_secs(),
                        "chunk batch timed out"
                    );
                    return Err(AppError::PartialIngestion { stored, total });
                }
            };

            stored = stored.saturating_add(batch_stored);
        }

        Ok(stored)
    }

    async fn store_batch(
        &self,
        doc_id: &str,
        batch: &[crate::chunker::PreparedChunk],
    ) -> Result<usize, AppError> {
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = self.services.embed_batch(texts).await?;

        if embeddings.len() != batch.len() {
            return Err(AppError::InternalError(format!(
                "embedding batch returned {} vectors for {} chunks",
                embeddings.len(),
                batch.len()
            )));
        }

        let records: Vec<DocumentChunk> = batch
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                DocumentChunk::new(
                    chunk.text.clone(),
                    ChunkMetadata::raw(doc_id, chunk.source.clone(), chunk.page),
                    embedding,
                )
            })
            .collect();

        self.services.store_batch(records).await
    }
}

fn join_segments(segments: &[TextSegment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::FileLoader;
    use common::storage::{db::SurrealDbClient, index::Corpus};
    use std::io::Write;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    const DIMENSION: usize = 8;

    async fn setup_index() -> (Arc<SurrealDbClient>, VectorIndex) {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let index = VectorIndex::open(Arc::clone(&db), Corpus::Raw, "test_ns", "test", DIMENSION);
        index.ensure_index().await.expect("Failed to define index");
        (db, index)
    }

    fn pipeline_over(index: VectorIndex, tuning: IngestionTuning) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::new(FileLoader),
            Arc::new(EmbeddingProvider::new_hashed(DIMENSION)),
            index,
            tuning,
        )
    }

    #[tokio::test]
    async fn ingest_stores_chunks_with_doc_id_metadata() {
        let (db, index) = setup_index().await;
        let pipeline = pipeline_over(index, IngestionTuning::default());

        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .expect("create temp file");
        writeln!(file, "The landlord may terminate with 60 days notice.").expect("write");

        let manifest = pipeline.ingest(file.path()).await.expect("ingest");

        assert!(manifest.num_chunks >= 1);
        assert!(manifest.extracted_text.contains("60 days"));
        assert!(manifest.file_name.ends_with(".txt"));
        assert!(manifest.vector_db_path.starts_with("surrealdb://"));

        let rows: Vec<DocumentChunk> = db.select("document_chunk").await.expect("select");
        assert_eq!(rows.len(), manifest.num_chunks);
        let expected_doc_id = file.path().display().to_string();
        assert!(rows
            .iter()
            .all(|chunk| chunk.metadata.doc_id == expected_doc_id));
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let (_db, index) = setup_index().await;
        let pipeline = pipeline_over(index, IngestionTuning::default());

        let err = pipeline
            .ingest(Path::new("/nonexistent/contract.txt"))
            .await
            .expect_err("missing path must fail");

        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_file_is_a_reported_error() {
        let (_db, index) = setup_index().await;
        let pipeline = pipeline_over(index, IngestionTuning::default());

        let file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .expect("create temp file");

        let err = pipeline
            .ingest(file.path())
            .await
            .expect_err("empty extraction must fail");

        assert!(matches!(err, AppError::EmptyDocument(_)));
    }

    #[tokio::test]
    async fn long_document_is_stored_across_batches() {
        let (db, index) = setup_index().await;
        let tuning = IngestionTuning {
            chunk_size: 80,
            chunk_overlap: 10,
            batch_size: 2,
            ..IngestionTuning::default()
        };
        let pipeline = pipeline_over(index, tuning);

        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .expect("create temp file");
        for clause in 0..12 {
            writeln!(file, "Clause {clause}: the parties agree to the stated terms.")
                .expect("write");
        }

        let manifest = pipeline.ingest(file.path()).await.expect("ingest");
        assert!(manifest.num_chunks > 2, "expected more than one batch");

        let rows: Vec<DocumentChunk> = db.select("document_chunk").await.expect("select");
        assert_eq!(rows.len(), manifest.num_chunks);
    }

    // Services mock that fails storage after a configured number of batches,
    // for exercising the partial-ingestion accounting.
    struct FlakyStore {
        segments: Vec<TextSegment>,
        batches_before_failure: usize,
        seen_batches: Mutex<usize>,
    }

    #[async_trait]
    impl IngestionServices for FlakyStore {
        async fn load_document(&self, _path: &Path) -> Result<Vec<TextSegment>, AppError> {
            Ok(self.segments.clone())
        }

        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.5; 4]).collect())
        }

        async fn store_batch(&self, chunks: Vec<DocumentChunk>) -> Result<usize, AppError> {
            let mut seen = self.seen_batches.lock().await;
            if *seen >= self.batches_before_failure {
                return Err(AppError::InternalError("index write refused".into()));
            }
            *seen += 1;
            Ok(chunks.len())
        }

        fn index_address(&self) -> String {
            "surrealdb://test_ns/test/document_chunk".to_owned()
        }
    }

    #[tokio::test]
    async fn failed_batch_reports_partial_ingestion() {
        let sentence = "All notices must be delivered in writing to the registered address. ";
        let services = FlakyStore {
            segments: vec![TextSegment {
                text: sentence.repeat(30),
                source: "big.txt".into(),
                page: None,
            }],
            batches_before_failure: 1,
            seen_batches: Mutex::new(0),
        };
        let tuning = IngestionTuning {
            chunk_size: 100,
            chunk_overlap: 0,
            batch_size: 3,
            ..IngestionTuning::default()
        };
        let pipeline = IngestionPipeline::with_services(Arc::new(services), tuning);

        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .expect("create temp file");
        writeln!(file, "placeholder so the path exists").expect("write");

        let err = pipeline
            .ingest(file.path())
            .await
            .expect_err("second batch must fail");

        match err {
            AppError::PartialIngestion { stored, total } => {
                assert_eq!(stored, 3, "exactly one full batch should have landed");
                assert!(total > stored);
            }
            other => panic!("expected PartialIngestion, got {other:?}"),
        }
    }
}
