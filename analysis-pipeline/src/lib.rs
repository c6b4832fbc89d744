#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod orchestrator;
pub mod outputs;
pub mod routing;
pub mod stages;
pub mod state;

pub use orchestrator::{AnalysisSink, Orchestrator, OrchestratorTuning};
pub use outputs::{
    ClausesOutput, ReportOutput, RiskFinding, RiskOutput, SimplifiedClause, StageOutput,
    SummaryOutput,
};
pub use routing::{LlmRoutePlanner, RoutePlan, RoutePlanner, RoutingDecision, RoutingStrategy};
pub use stages::{LiveStageServices, StageServices};
pub use state::{PipelineEvent, PipelineFailure, PipelinePhase, PipelineState, StageId};
