use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outputs::StageOutput;

/// The model-backed transformations a document runs through. The set is
/// closed: routing decisions are validated against it and anything else
/// terminates the run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Summarize,
    ExplainClauses,
    AssessRisk,
    GenerateReport,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::Summarize,
        StageId::ExplainClauses,
        StageId::AssessRisk,
        StageId::GenerateReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Summarize => "summarize",
            StageId::ExplainClauses => "explain_clauses",
            StageId::AssessRisk => "assess_risk",
            StageId::GenerateReport => "generate_report",
        }
    }

    /// Stages whose outputs must be present before this one may run.
    /// Summarization and clause explanation are independent of each other;
    /// risk needs both; the report needs risk.
    pub fn dependencies(self) -> &'static [StageId] {
        match self {
            StageId::Summarize | StageId::ExplainClauses => &[],
            StageId::AssessRisk => &[StageId::Summarize, StageId::ExplainClauses],
            StageId::GenerateReport => &[StageId::AssessRisk],
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim() {
            "summarize" => Some(StageId::Summarize),
            "explain_clauses" => Some(StageId::ExplainClauses),
            "assess_risk" => Some(StageId::AssessRisk),
            "generate_report" => Some(StageId::GenerateReport),
            _ => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milestones of one run, projected onto a single axis. Summarization and
/// clause explanation are unordered between themselves; the phase reports
/// the furthest milestone reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelinePhase {
    Init,
    Ingested,
    Summarized,
    ClausesExplained,
    RiskAssessed,
    Reported,
    Terminal,
}

/// One line of the per-run event log, in the order things happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Why a run ended unsuccessfully. `stage` is unset for failures that are
/// not attributable to a single stage (for example an exhausted routing
/// budget).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineFailure {
    pub stage: Option<StageId>,
    pub message: String,
}

/// Everything one document run has produced so far. Created per document,
/// mutated only between routing steps by the orchestrator, discarded after
/// the terminal step; never shared across documents.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub doc_id: String,
    pub file_name: String,
    pub extracted_text: String,
    pub vector_db_path: Option<String>,
    pub outputs: BTreeMap<StageId, StageOutput>,
    pub events: Vec<PipelineEvent>,
    pub failure: Option<PipelineFailure>,
    pub aborted: bool,
    pub terminal: bool,
}

impl PipelineState {
    pub fn new(
        doc_id: impl Into<String>,
        file_name: impl Into<String>,
        extracted_text: impl Into<String>,
        vector_db_path: Option<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            file_name: file_name.into(),
            extracted_text: extracted_text.into(),
            vector_db_path,
            outputs: BTreeMap::new(),
            events: Vec::new(),
            failure: None,
            aborted: false,
            terminal: false,
        }
    }

    pub fn has(&self, stage: StageId) -> bool {
        self.outputs.contains_key(&stage)
    }

    pub fn output(&self, stage: StageId) -> Option<&StageOutput> {
        self.outputs.get(&stage)
    }

    pub fn insert_output(&mut self, stage: StageId, output: StageOutput) {
        self.outputs.insert(stage, output);
    }

    pub fn record_event(&mut self, message: impl Into<String>) {
        self.events.push(PipelineEvent {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Furthest milestone reached, ignoring how the run ended.
    pub fn milestone(&self) -> PipelinePhase {
        if self.has(StageId::GenerateReport) {
            PipelinePhase::Reported
        } else if self.has(StageId::AssessRisk) {
            PipelinePhase::RiskAssessed
        } else if self.has(StageId::ExplainClauses) {
            PipelinePhase::ClausesExplained
        } else if self.has(StageId::Summarize) {
            PipelinePhase::Summarized
        } else if self.extracted_text.trim().is_empty() {
            PipelinePhase::Init
        } else {
            PipelinePhase::Ingested
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        if self.terminal || self.aborted || self.failure.is_some() {
            PipelinePhase::Terminal
        } else {
            self.milestone()
        }
    }
}
