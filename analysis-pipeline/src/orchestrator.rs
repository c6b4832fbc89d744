use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        index::VectorIndex,
        types::document_chunk::{ChunkMetadata, DocumentChunk},
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    outputs::StageOutput,
    routing::{
        deterministic_plan, validate_delegated, RoutePlan, RoutingDecision, RoutingStrategy,
    },
    stages::{invoke_and_parse, stage_input, StageServices},
    state::{PipelineFailure, PipelineState, StageId},
};

/// Knobs for a single analysis run. The stage timeout bounds both stage
/// invocations and delegated routing calls.
#[derive(Debug, Clone)]
pub struct OrchestratorTuning {
    pub stage_timeout: Duration,
    pub input_char_cap: usize,
    pub max_routing_steps: usize,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(120),
            input_char_cap: 20_000,
            max_routing_steps: 16,
        }
    }
}

impl OrchestratorTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            input_char_cap: config.stage_input_char_cap,
            max_routing_steps: config.max_routing_steps,
        }
    }
}

/// Writes completed stage outputs into the analysis corpus so question
/// answering can retrieve them later.
pub struct AnalysisSink {
    embedding_provider: Arc<EmbeddingProvider>,
    index: VectorIndex,
}

impl AnalysisSink {
    pub fn new(embedding_provider: Arc<EmbeddingProvider>, index: VectorIndex) -> Self {
        Self {
            embedding_provider,
            index,
        }
    }

    /// Embeds and stores one stage output. Returns false when the stage has
    /// no corpus rendering (the report is consumed directly, not retrieved).
    async fn persist(
        &self,
        doc_id: &str,
        stage: StageId,
        output: &StageOutput,
    ) -> Result<bool, AppError> {
        let Some(text) = output.corpus_text() else {
            return Ok(false);
        };

        let embedding = self.embedding_provider.embed(&text).await?;
        let chunk = DocumentChunk::new(
            text,
            ChunkMetadata::analysis(doc_id, stage.as_str()),
            embedding,
        );
        self.index.upsert_batch(vec![chunk]).await?;
        Ok(true)
    }
}

enum BatchOutcome {
    Completed,
    Aborted,
    Failed(PipelineFailure),
}

/// Drives a document analysis run to a terminal state.
///
/// Each iteration asks the routing strategy for a plan, runs the planned
/// stages concurrently, and folds their outputs back into the state. A run
/// always returns a state; stage failures, routing failures, cancellation,
/// and budget exhaustion all land as terminal states, never as errors.
pub struct Orchestrator {
    services: Arc<dyn StageServices>,
    strategy: RoutingStrategy,
    analysis_sink: Option<AnalysisSink>,
    tuning: OrchestratorTuning,
}

impl Orchestrator {
    pub fn new(
        services: Arc<dyn StageServices>,
        strategy: RoutingStrategy,
        analysis_sink: Option<AnalysisSink>,
        tuning: OrchestratorTuning,
    ) -> Self {
        Self {
            services,
            strategy,
            analysis_sink,
            tuning,
        }
    }

    #[tracing::instrument(skip_all, fields(doc_id = %state.doc_id))]
    pub async fn run(
        &self,
        mut state: PipelineState,
        cancellation: CancellationToken,
    ) -> PipelineState {
        let started = Instant::now();

        for _ in 0..self.tuning.max_routing_steps {
            if cancellation.is_cancelled() {
                return abort(state);
            }

            match self.next_plan(&state).await {
                RoutePlan::Finish(reason) => {
                    state.record_event(format!("terminal: {reason}"));
                    state.terminal = true;
                    info!(
                        milestone = ?state.milestone(),
                        total_ms = duration_millis(started.elapsed()),
                        "analysis run finished"
                    );
                    return state;
                }
                RoutePlan::Run(stages) => {
                    let names: Vec<&str> = stages.iter().map(|stage| stage.as_str()).collect();
                    state.record_event(format!("running stages: {}", names.join(", ")));

                    match self.run_batch(&mut state, &stages, &cancellation).await {
                        BatchOutcome::Completed => {}
                        BatchOutcome::Aborted => return abort(state),
                        BatchOutcome::Failed(failure) => {
                            state.failure = Some(failure);
                            state.terminal = true;
                            return state;
                        }
                    }
                }
            }
        }

        state.record_event("routing step budget exhausted");
        state.failure = Some(PipelineFailure {
            stage: None,
            message: format!(
                "no terminal decision after {} routing steps",
                self.tuning.max_routing_steps
            ),
        });
        state.terminal = true;
        state
    }

    async fn next_plan(&self, state: &PipelineState) -> RoutePlan {
        match &self.strategy {
            RoutingStrategy::Deterministic => deterministic_plan(state),
            RoutingStrategy::Delegated(planner) => {
                let secs = self.tuning.stage_timeout.as_secs();
                match timeout(self.tuning.stage_timeout, planner.propose(state)).await {
                    Ok(Ok(payload)) => {
                        let decision = RoutingDecision::from_wire(&payload);
                        debug!(
                            target = ?decision.target,
                            reason = %decision.reason,
                            "delegated routing decision"
                        );
                        validate_delegated(&decision, state)
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, "delegated routing call failed");
                        RoutePlan::Finish(format!("routing call failed: {err}"))
                    }
                    Err(_) => RoutePlan::Finish(format!("routing call timed out after {secs}s")),
                }
            }
        }
    }

    /// Runs one batch of stages concurrently. The first stage error fails the
    /// whole batch; in-flight siblings are dropped with it.
    async fn run_batch(
        &self,
        state: &mut PipelineState,
        stages: &[StageId],
        cancellation: &CancellationToken,
    ) -> BatchOutcome {
        let mut inputs = Vec::with_capacity(stages.len());
        for stage in stages {
            match stage_input(*stage, state, self.tuning.input_char_cap) {
                Ok(input) => inputs.push((*stage, input)),
                Err(err) => {
                    warn!(stage = %stage, error = %err, "stage input assembly failed");
                    state.record_event(format!("stage {stage} failed: {err}"));
                    return BatchOutcome::Failed(PipelineFailure {
                        stage: Some(*stage),
                        message: err.to_string(),
                    });
                }
            }
        }

        let limit = self.tuning.stage_timeout;
        let mut tasks: FuturesUnordered<_> = inputs
            .into_iter()
            .map(|(stage, input)| {
                let services = Arc::clone(&self.services);
                async move {
                    let started = Instant::now();
                    let outcome =
                        match timeout(limit, invoke_and_parse(services.as_ref(), stage, &input))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                Err(AppError::invocation_timeout(stage.as_str(), limit.as_secs()))
                            }
                        };
                    (stage, outcome, started.elapsed())
                }
            })
            .collect();

        loop {
            let next = tokio::select! {
                () = cancellation.cancelled() => return BatchOutcome::Aborted,
                next = tasks.next() => next,
            };
            let Some((stage, outcome, elapsed)) = next else {
                return BatchOutcome::Completed;
            };

            match outcome {
                Ok(output) => {
                    info!(stage = %stage, stage_ms = duration_millis(elapsed), "stage finished");
                    state.record_event(format!("stage {stage} finished"));
                    self.persist_artifact(&state.doc_id, stage, &output).await;
                    state.insert_output(stage, output);
                }
                Err(err) => {
                    warn!(stage = %stage, error = %err, "stage failed");
                    state.record_event(format!("stage {stage} failed: {err}"));
                    return BatchOutcome::Failed(PipelineFailure {
                        stage: Some(stage),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Artifact persistence is advisory. A failed or timed-out write degrades
    /// question answering over this document but never fails the analysis run.
    async fn persist_artifact(&self, doc_id: &str, stage: StageId, output: &StageOutput) {
        let Some(sink) = &self.analysis_sink else {
            return;
        };
        match timeout(self.tuning.stage_timeout, sink.persist(doc_id, stage, output)).await {
            Ok(Ok(true)) => debug!(stage = %stage, "analysis artifact persisted"),
            Ok(Ok(false)) => {}
            Ok(Err(err)) => {
                warn!(stage = %stage, error = %err, "analysis artifact persistence failed");
            }
            Err(_) => {
                warn!(
                    stage = %stage,
                    timeout_secs = self.tuning.stage_timeout.as_secs(),
                    "analysis artifact persistence timed out"
                );
            }
        }
    }
}

fn abort(mut state: PipelineState) -> PipelineState {
    warn!("analysis run aborted");
    state.record_event("analysis aborted by cancellation");
    state.aborted = true;
    state.terminal = true;
    state
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
