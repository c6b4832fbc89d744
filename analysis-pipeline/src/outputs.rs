use common::{error::AppError, utils::llm::parse_json_object};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::StageId;

/// Output of the summarization stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryOutput {
    pub summary: String,
    pub key_points: Vec<String>,
    pub detailed_explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimplifiedClause {
    pub original_clause: String,
    pub simplified_explanation: String,
}

/// Output of the clause-explanation stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClausesOutput {
    pub simplified_clauses: Vec<SimplifiedClause>,
}

/// One identified risk. Severity and probability stay free-form strings;
/// the model's vocabulary is not contractual and normalizing it is a
/// presentation concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFinding {
    pub id: String,
    pub category: String,
    pub severity: String,
    pub probability: String,
    pub clause_reference: String,
    pub clause_excerpt: String,
    pub explanation: String,
    pub recommendation: String,
}

/// Output of the risk-assessment stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskOutput {
    pub overall_risk_level: String,
    pub overall_risk_score: f32,
    pub risks: Vec<RiskFinding>,
    pub assumptions_or_uncertainties: Vec<String>,
}

/// Output of the report stage, ready to hand to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportOutput {
    pub report_markdown: String,
    pub highlights: Vec<String>,
    pub file_name: String,
    pub overall_risk_level: String,
    pub overall_risk_score: f32,
    pub risks_count: usize,
}

/// Everything a stage may produce, keyed by the stage that produced it.
/// Parsing and validation happen once, here, at the stage boundary; nothing
/// downstream touches raw model text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    Summarize(SummaryOutput),
    ExplainClauses(ClausesOutput),
    AssessRisk(RiskOutput),
    GenerateReport(ReportOutput),
}

impl StageOutput {
    pub fn stage(&self) -> StageId {
        match self {
            StageOutput::Summarize(_) => StageId::Summarize,
            StageOutput::ExplainClauses(_) => StageId::ExplainClauses,
            StageOutput::AssessRisk(_) => StageId::AssessRisk,
            StageOutput::GenerateReport(_) => StageId::GenerateReport,
        }
    }

    /// Parses raw model text as the output of `stage`. The payload must be a
    /// single JSON object matching that stage's record shape; anything else
    /// is `MalformedOutput`, a recorded failure rather than a crash.
    pub fn parse(stage: StageId, payload: &str) -> Result<Self, AppError> {
        let object = parse_json_object(payload)?;

        let value = Value::Object(object);
        let parsed = match stage {
            StageId::Summarize => {
                serde_json::from_value::<SummaryOutput>(value).map(StageOutput::Summarize)
            }
            StageId::ExplainClauses => {
                serde_json::from_value::<ClausesOutput>(value).map(StageOutput::ExplainClauses)
            }
            StageId::AssessRisk => {
                serde_json::from_value::<RiskOutput>(value).map(StageOutput::AssessRisk)
            }
            StageId::GenerateReport => {
                serde_json::from_value::<ReportOutput>(value).map(StageOutput::GenerateReport)
            }
        };

        parsed.map_err(|err| {
            AppError::MalformedOutput(format!("{stage} output did not match its shape: {err}"))
        })
    }

    /// Text rendering stored in the analysis corpus so QA can retrieve it.
    /// The report is derived from the other outputs and is not re-embedded.
    pub fn corpus_text(&self) -> Option<String> {
        match self {
            StageOutput::Summarize(output) => {
                let mut text = format!("Summary: {}", output.summary);
                if !output.key_points.is_empty() {
                    text.push_str("\nKey points:");
                    for point in &output.key_points {
                        text.push_str("\n- ");
                        text.push_str(point);
                    }
                }
                if !output.detailed_explanation.is_empty() {
                    text.push('\n');
                    text.push_str(&output.detailed_explanation);
                }
                Some(text)
            }
            StageOutput::ExplainClauses(output) => {
                if output.simplified_clauses.is_empty() {
                    return None;
                }
                let rendered: Vec<String> = output
                    .simplified_clauses
                    .iter()
                    .map(|clause| {
                        format!(
                            "Clause: {}\nIn plain terms: {}",
                            clause.original_clause, clause.simplified_explanation
                        )
                    })
                    .collect();
                Some(rendered.join("\n\n"))
            }
            StageOutput::AssessRisk(output) => {
                let mut text = format!(
                    "Overall risk: {} (score {:.2})",
                    output.overall_risk_level, output.overall_risk_score
                );
                for risk in &output.risks {
                    text.push_str(&format!(
                        "\n- [{}] {}: {} (clause {}) Recommendation: {}",
                        risk.severity,
                        risk.category,
                        risk.explanation,
                        risk.clause_reference,
                        risk.recommendation
                    ));
                }
                if !output.assumptions_or_uncertainties.is_empty() {
                    text.push_str("\nAssumptions:");
                    for assumption in &output.assumptions_or_uncertainties {
                        text.push_str("\n- ");
                        text.push_str(assumption);
                    }
                }
                Some(text)
            }
            StageOutput::GenerateReport(_) => None,
        }
    }
}
