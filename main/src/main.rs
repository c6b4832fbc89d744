use std::{path::PathBuf, sync::Arc};

use analysis_pipeline::{
    AnalysisSink, LiveStageServices, LlmRoutePlanner, Orchestrator, OrchestratorTuning,
    PipelineState, RoutingStrategy, StageId, StageOutput,
};
use anyhow::{bail, Context};
use async_openai::{config::OpenAIConfig, Client};
use common::{
    storage::{
        db::SurrealDbClient,
        index::{Corpus, VectorIndex},
    },
    utils::{
        config::{get_config, AppConfig, RoutingMode},
        embedding::EmbeddingProvider,
    },
};
use ingestion_pipeline::{FileLoader, IngestionPipeline, IngestionTuning};
use retrieval_pipeline::{DefaultQaServices, QaEngine, QaTuning};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: docket <document-path>");
    };

    let config = get_config().context("loading configuration")?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await
        .context("connecting to surrealdb")?,
    );

    let openai_client = Arc::new(Client::with_config(
        OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedding_provider = Arc::new(EmbeddingProvider::new_openai(
        Arc::clone(&openai_client),
        config.embedding_model.clone(),
        config.embedding_dimensions,
    ));
    info!(
        backend = embedding_provider.backend_label(),
        dimension = embedding_provider.dimension(),
        "embedding provider initialized"
    );

    let raw_index = VectorIndex::open(
        Arc::clone(&db),
        Corpus::Raw,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
        embedding_provider.dimension(),
    );
    let analysis_index = VectorIndex::open(
        Arc::clone(&db),
        Corpus::Analysis,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
        embedding_provider.dimension(),
    );
    raw_index
        .ensure_index()
        .await
        .context("preparing the raw corpus index")?;
    analysis_index
        .ensure_index()
        .await
        .context("preparing the analysis corpus index")?;

    // Ctrl-C aborts the analysis run instead of killing the process mid-write.
    let cancellation = CancellationToken::new();
    let signal_token = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting analysis");
            signal_token.cancel();
        }
    });

    let pipeline = IngestionPipeline::new(
        Arc::new(FileLoader),
        Arc::clone(&embedding_provider),
        raw_index.clone(),
        IngestionTuning::from_config(&config),
    );
    let manifest = pipeline.ingest(&path).await.context("ingestion")?;
    info!(
        file_name = %manifest.file_name,
        num_chunks = manifest.num_chunks,
        "document ingested"
    );

    let doc_id = path.display().to_string();
    let services = Arc::new(LiveStageServices::new(
        Arc::clone(&openai_client),
        config.chat_model.clone(),
    ));
    let strategy = match config.routing_mode {
        RoutingMode::Deterministic => RoutingStrategy::Deterministic,
        RoutingMode::Delegated => RoutingStrategy::Delegated(Arc::new(LlmRoutePlanner::new(
            Arc::clone(&openai_client),
            config.chat_model.clone(),
        ))),
    };
    let sink = AnalysisSink::new(Arc::clone(&embedding_provider), analysis_index.clone());
    let orchestrator = Orchestrator::new(
        services,
        strategy,
        Some(sink),
        OrchestratorTuning::from_config(&config),
    );

    let state = PipelineState::new(
        doc_id.clone(),
        manifest.file_name,
        manifest.extracted_text,
        Some(manifest.vector_db_path),
    );
    let state = orchestrator.run(state, cancellation).await;

    if state.aborted {
        warn!("analysis aborted before completion");
        return Ok(());
    }
    if let Some(failure) = &state.failure {
        match failure.stage {
            Some(stage) => bail!("analysis failed at stage {stage}: {}", failure.message),
            None => bail!("analysis failed: {}", failure.message),
        }
    }

    match state.output(StageId::GenerateReport) {
        Some(StageOutput::GenerateReport(report)) => println!("{}", report.report_markdown),
        _ => warn!("run reached terminal without producing a report"),
    }

    qa_session(
        &config,
        openai_client,
        embedding_provider,
        raw_index,
        analysis_index,
        doc_id,
    )
    .await
}

/// Interactive follow-up questions over the ingested document. One question
/// per line on stdin; EOF ends the session.
async fn qa_session(
    config: &AppConfig,
    openai_client: Arc<Client<OpenAIConfig>>,
    embedding_provider: Arc<EmbeddingProvider>,
    raw_index: VectorIndex,
    analysis_index: VectorIndex,
    doc_id: String,
) -> anyhow::Result<()> {
    let services = Arc::new(DefaultQaServices::new(
        openai_client,
        config.chat_model.clone(),
        embedding_provider,
        raw_index,
        Some(analysis_index),
    ));
    let mut engine = QaEngine::new(services, Some(doc_id), QaTuning::from_config(config));

    eprintln!();
    eprintln!("Ask about the document. One question per line, Ctrl-D ends the session.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        let answer = engine.answer(question).await;
        for caveat in &answer.caveats {
            warn!(caveat = %caveat, "answer caveat");
        }
        println!("{}", answer.answer);
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use analysis_pipeline::{PipelinePhase, StageServices};
    use async_trait::async_trait;
    use common::error::AppError;
    use ingestion_pipeline::{DocumentLoader, TextSegment};
    use serde_json::Value;
    use uuid::Uuid;

    use super::*;

    const DIMENSION: usize = 8;

    fn segment(text: &str, page: u32) -> TextSegment {
        TextSegment {
            text: text.to_owned(),
            source: "lease.pdf".to_owned(),
            page: Some(page),
        }
    }

    struct ThreeSegmentLoader;

    #[async_trait]
    impl DocumentLoader for ThreeSegmentLoader {
        async fn load(&self, _path: &Path) -> Result<Vec<TextSegment>, AppError> {
            Ok(vec![
                segment(
                    "The landlord leases the flat at 12 Harbour Lane to the tenant for twelve months.",
                    1,
                ),
                segment(
                    "The tenant pays 950 euros in rent on the first business day of every month.",
                    2,
                ),
                segment(
                    "Either party may terminate this agreement with three months written notice.",
                    3,
                ),
            ])
        }
    }

    fn canned_payload(stage: StageId) -> String {
        match stage {
            StageId::Summarize => {
                r#"{"summary": "A twelve month lease.", "key_points": ["Rent is 950 euros."], "detailed_explanation": "The tenant rents the flat for a year."}"#
            }
            StageId::ExplainClauses => {
                r#"{"simplified_clauses": [{"original_clause": "Either party may terminate with three months notice.", "simplified_explanation": "Both sides can walk away with three months warning."}]}"#
            }
            StageId::AssessRisk => {
                r#"{"overall_risk_level": "low", "overall_risk_score": 0.2, "risks": [], "assumptions_or_uncertainties": []}"#
            }
            StageId::GenerateReport => {
                r#"{"report_markdown": "# Lease analysis\n\nLow risk.", "highlights": ["Low risk."], "file_name": "lease.pdf", "overall_risk_level": "low", "overall_risk_score": 0.2, "risks_count": 0}"#
            }
        }
        .to_owned()
    }

    #[derive(Default)]
    struct ProbeStage {
        current: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<StageId>>,
    }

    #[async_trait]
    impl StageServices for ProbeStage {
        async fn invoke_stage(&self, stage: StageId, _input: &Value) -> Result<String, AppError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.order.lock().expect("lock").push(stage);
            Ok(canned_payload(stage))
        }
    }

    #[tokio::test]
    async fn full_run_ingests_analyzes_and_reports_offline() {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let provider = Arc::new(EmbeddingProvider::new_hashed(DIMENSION));
        let raw_index =
            VectorIndex::open(Arc::clone(&db), Corpus::Raw, "test_ns", "test_db", DIMENSION);
        let analysis_index = VectorIndex::open(
            Arc::clone(&db),
            Corpus::Analysis,
            "test_ns",
            "test_db",
            DIMENSION,
        );
        raw_index.ensure_index().await.expect("raw index");
        analysis_index.ensure_index().await.expect("analysis index");

        // Small chunks force each segment to split, so the chunker yields
        // more chunks than segments.
        let tuning = IngestionTuning {
            chunk_size: 40,
            chunk_overlap: 10,
            ..IngestionTuning::default()
        };
        let pipeline = IngestionPipeline::new(
            Arc::new(ThreeSegmentLoader),
            Arc::clone(&provider),
            raw_index.clone(),
            tuning,
        );

        let file = tempfile::NamedTempFile::new().expect("temp file");
        let manifest = pipeline.ingest(file.path()).await.expect("ingest");
        assert!(manifest.num_chunks >= 3);
        assert!(manifest.extracted_text.contains("950 euros"));

        let services = Arc::new(ProbeStage::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&services) as Arc<dyn StageServices>,
            RoutingStrategy::Deterministic,
            Some(AnalysisSink::new(
                Arc::clone(&provider),
                analysis_index.clone(),
            )),
            OrchestratorTuning::default(),
        );

        let doc_id = file.path().display().to_string();
        let state = PipelineState::new(
            doc_id,
            manifest.file_name,
            manifest.extracted_text,
            Some(manifest.vector_db_path),
        );
        let state = orchestrator.run(state, CancellationToken::new()).await;

        assert!(state.terminal);
        assert!(!state.aborted);
        assert!(state.failure.is_none());
        assert_eq!(state.outputs.len(), 4);
        assert_eq!(state.milestone(), PipelinePhase::Reported);

        // The first wave ran concurrently, then risk, then the report.
        assert_eq!(services.peak.load(Ordering::SeqCst), 2);
        let order = services.order.lock().expect("lock").clone();
        assert_eq!(order[2], StageId::AssessRisk);
        assert_eq!(order[3], StageId::GenerateReport);

        let query = provider
            .embed("three months written notice")
            .await
            .expect("embed");
        let hits = raw_index.search(query, 6).await.expect("search");
        assert!(hits.len() >= 3);

        let query = provider.embed("overall risk").await.expect("embed");
        let artifacts = analysis_index.search(query, 8).await.expect("search");
        assert_eq!(artifacts.len(), 3);

        match state.output(StageId::GenerateReport) {
            Some(StageOutput::GenerateReport(report)) => {
                assert!(report.report_markdown.starts_with("# Lease analysis"));
            }
            other => panic!("missing report output: {other:?}"),
        }
    }
}
