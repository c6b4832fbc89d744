use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use common::{error::AppError, utils::llm::response_text};
use serde_json::{json, Value};

use crate::{
    outputs::{StageOutput, SummaryOutput},
    state::{PipelineState, StageId},
};

/// Executes a single analysis stage against some backend and returns the raw
/// payload. Shape validation happens in [`invoke_and_parse`], not here.
#[async_trait]
pub trait StageServices: Send + Sync {
    async fn invoke_stage(&self, stage: StageId, input: &Value) -> Result<String, AppError>;
}

/// Builds the input document for a stage from the pipeline state.
///
/// The extracted text is capped at `char_cap` characters before it goes into
/// any prompt. Stages that consume upstream outputs read them from the state;
/// scheduling guarantees they are present, so a missing one is an internal
/// error, not a user-facing condition.
pub fn stage_input(
    stage: StageId,
    state: &PipelineState,
    char_cap: usize,
) -> Result<Value, AppError> {
    let text = capped(&state.extracted_text, char_cap);
    match stage {
        StageId::Summarize | StageId::ExplainClauses => Ok(json!({ "extracted_text": text })),
        StageId::AssessRisk => {
            let summary = require_summary(state, stage)?;
            let clauses = require_clauses(state, stage)?;
            Ok(json!({
                "extracted_text": text,
                "summary": &summary.summary,
                "simplified_clauses": clauses,
            }))
        }
        StageId::GenerateReport => {
            let summary = require_summary(state, stage)?;
            let clauses = require_clauses(state, stage)?;
            let risk = match state.output(StageId::AssessRisk) {
                Some(StageOutput::AssessRisk(risk)) => risk,
                _ => return Err(missing_input(stage, StageId::AssessRisk)),
            };
            Ok(json!({
                "file_name": &state.file_name,
                "vector_db_path": &state.vector_db_path,
                "extracted_text": text,
                "summary": &summary.summary,
                "key_points": &summary.key_points,
                "detailed_explanation": &summary.detailed_explanation,
                "simplified_clauses": clauses,
                "risk_assessment": risk,
            }))
        }
    }
}

/// Runs a stage and validates its payload into a typed output. Any payload
/// that does not match the stage's shape surfaces as a malformed-output error.
pub async fn invoke_and_parse(
    services: &dyn StageServices,
    stage: StageId,
    input: &Value,
) -> Result<StageOutput, AppError> {
    let payload = services.invoke_stage(stage, input).await?;
    StageOutput::parse(stage, &payload)
}

fn capped(text: &str, char_cap: usize) -> String {
    text.chars().take(char_cap).collect()
}

fn require_summary<'a>(
    state: &'a PipelineState,
    stage: StageId,
) -> Result<&'a SummaryOutput, AppError> {
    match state.output(StageId::Summarize) {
        Some(StageOutput::Summarize(summary)) => Ok(summary),
        _ => Err(missing_input(stage, StageId::Summarize)),
    }
}

fn require_clauses<'a>(
    state: &'a PipelineState,
    stage: StageId,
) -> Result<&'a [crate::outputs::SimplifiedClause], AppError> {
    match state.output(StageId::ExplainClauses) {
        Some(StageOutput::ExplainClauses(clauses)) => Ok(&clauses.simplified_clauses),
        _ => Err(missing_input(stage, StageId::ExplainClauses)),
    }
}

fn missing_input(stage: StageId, dependency: StageId) -> AppError {
    AppError::InternalError(format!(
        "stage {stage} was scheduled before {dependency} produced its output"
    ))
}

/// Model-backed stage execution. Each stage has its own system prompt and a
/// strict response schema matching the typed output for that stage.
pub struct LiveStageServices {
    openai_client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl LiveStageServices {
    pub fn new(openai_client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            openai_client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl StageServices for LiveStageServices {
    #[tracing::instrument(skip_all, fields(stage = %stage))]
    async fn invoke_stage(&self, stage: StageId, input: &Value) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt(stage).to_owned()).into(),
                ChatCompletionRequestUserMessage::from(input.to_string()).into(),
            ])
            .response_format(response_format(stage))
            .build()?;

        let response = self.openai_client.chat().create(request).await?;
        response_text(response)
    }
}

fn system_prompt(stage: StageId) -> &'static str {
    match stage {
        StageId::Summarize => {
            "You summarize legal contracts for non-lawyers. Produce a short summary, \
             the key points a signer must know, and a longer plain-language explanation. \
             Respond with a single JSON object with the fields summary, key_points, and \
             detailed_explanation, and no other text."
        }
        StageId::ExplainClauses => {
            "You translate contract clauses into plain language. Identify each substantive \
             clause in the document and restate what it obliges or entitles the parties to, \
             in words a layperson understands. Respond with a single JSON object with the \
             field simplified_clauses, an array of objects with original_clause and \
             simplified_explanation, and no other text."
        }
        StageId::AssessRisk => {
            "You assess contractual risk for the signing party. Using the document, its \
             summary, and the simplified clauses, identify concrete risks, rate severity \
             and probability, reference the clause each risk stems from with a short \
             excerpt, and recommend a mitigation for each. Respond with a single JSON \
             object with the fields overall_risk_level, overall_risk_score, risks, and \
             assumptions_or_uncertainties, and no other text."
        }
        StageId::GenerateReport => {
            "You assemble a final contract analysis report in Markdown. Merge the summary, \
             the simplified clauses, and the risk assessment into a readable report, and \
             pick out the highlights a reader should see first. Respond with a single JSON \
             object with the fields report_markdown, highlights, file_name, \
             overall_risk_level, overall_risk_score, and risks_count, and no other text."
        }
    }
}

fn response_format(stage: StageId) -> ResponseFormat {
    ResponseFormat::JsonSchema {
        json_schema: ResponseFormatJsonSchema {
            description: Some(format!("Structured output of the {stage} stage")),
            name: format!("{stage}_output"),
            schema: Some(output_schema(stage)),
            strict: Some(true),
        },
    }
}

fn output_schema(stage: StageId) -> Value {
    match stage {
        StageId::Summarize => json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" },
                "key_points": { "type": "array", "items": { "type": "string" } },
                "detailed_explanation": { "type": "string" }
            },
            "required": ["summary", "key_points", "detailed_explanation"],
            "additionalProperties": false
        }),
        StageId::ExplainClauses => json!({
            "type": "object",
            "properties": {
                "simplified_clauses": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "original_clause": { "type": "string" },
                            "simplified_explanation": { "type": "string" }
                        },
                        "required": ["original_clause", "simplified_explanation"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["simplified_clauses"],
            "additionalProperties": false
        }),
        StageId::AssessRisk => json!({
            "type": "object",
            "properties": {
                "overall_risk_level": { "type": "string" },
                "overall_risk_score": { "type": "number" },
                "risks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "category": { "type": "string" },
                            "severity": { "type": "string" },
                            "probability": { "type": "string" },
                            "clause_reference": { "type": "string" },
                            "clause_excerpt": { "type": "string" },
                            "explanation": { "type": "string" },
                            "recommendation": { "type": "string" }
                        },
                        "required": [
                            "id",
                            "category",
                            "severity",
                            "probability",
                            "clause_reference",
                            "clause_excerpt",
                            "explanation",
                            "recommendation"
                        ],
                        "additionalProperties": false
                    }
                },
                "assumptions_or_uncertainties": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": [
                "overall_risk_level",
                "overall_risk_score",
                "risks",
                "assumptions_or_uncertainties"
            ],
            "additionalProperties": false
        }),
        StageId::GenerateReport => json!({
            "type": "object",
            "properties": {
                "report_markdown": { "type": "string" },
                "highlights": { "type": "array", "items": { "type": "string" } },
                "file_name": { "type": "string" },
                "overall_risk_level": { "type": "string" },
                "overall_risk_score": { "type": "number" },
                "risks_count": { "type": "integer" }
            },
            "required": [
                "report_markdown",
                "highlights",
                "file_name",
                "overall_risk_level",
                "overall_risk_score",
                "risks_count"
            ],
            "additionalProperties": false
        }),
    }
}
