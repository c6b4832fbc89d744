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
use serde_json::Value;

use crate::state::{PipelineState, StageId};

/// Where a routing decision points: a known stage or the end of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Stage(StageId),
    Terminal,
}

/// A decoded routing decision. Immutable once emitted; the target is always
/// resolved, never left as unvalidated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub reason: String,
}

impl RoutingDecision {
    /// Decodes the wire form `{"next_stage": string, "reason": string}`.
    ///
    /// The decode is total: non-JSON payloads, non-objects, and unknown stage
    /// names all come back as `Terminal` with the problem as the reason. The
    /// run degrades to a clean stop, never to an undefined state.
    pub fn from_wire(payload: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return Self::terminal("routing decision was not valid JSON");
        };

        let Some(object) = value.as_object() else {
            return Self::terminal("routing decision was not a JSON object");
        };

        let reason = object
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason given")
            .to_owned();

        let Some(name) = object.get("next_stage").and_then(Value::as_str) else {
            return Self::terminal("routing decision named no next_stage");
        };

        match name.trim() {
            "TERMINAL" | "terminal" | "end" => Self {
                target: RouteTarget::Terminal,
                reason,
            },
            other => match StageId::from_wire(other) {
                Some(stage) => Self {
                    target: RouteTarget::Stage(stage),
                    reason,
                },
                None => Self::terminal(format!("unknown stage '{other}'")),
            },
        }
    }

    fn terminal(reason: impl Into<String>) -> Self {
        Self {
            target: RouteTarget::Terminal,
            reason: reason.into(),
        }
    }
}

/// Stages whose dependencies are all present and which have not run yet,
/// in declaration order. Pure function of the state.
pub fn ready_stages(state: &PipelineState) -> Vec<StageId> {
    StageId::ALL
        .into_iter()
        .filter(|stage| !state.has(*stage))
        .filter(|stage| stage.dependencies().iter().all(|dep| state.has(*dep)))
        .collect()
}

/// What the orchestrator should do next: run a non-empty batch of stages,
/// or stop with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePlan {
    Run(Vec<StageId>),
    Finish(String),
}

/// Fixed-precedence routing: run everything that is ready, finish when
/// nothing is. Always progresses or terminates.
pub fn deterministic_plan(state: &PipelineState) -> RoutePlan {
    let ready = ready_stages(state);
    if ready.is_empty() {
        RoutePlan::Finish("no runnable stages remain".to_owned())
    } else {
        RoutePlan::Run(ready)
    }
}

/// Validates a delegated proposal against the precedence table.
///
/// A proposed stage that is ready runs alone, exactly as proposed. A
/// parseable proposal for a stage that is not ready is rejected and
/// re-routed to the full ready set (or to a finish when nothing is ready).
/// Terminal proposals are honored as given.
pub fn validate_delegated(decision: &RoutingDecision, state: &PipelineState) -> RoutePlan {
    match decision.target {
        RouteTarget::Terminal => RoutePlan::Finish(decision.reason.clone()),
        RouteTarget::Stage(stage) => {
            let ready = ready_stages(state);
            if ready.contains(&stage) {
                RoutePlan::Run(vec![stage])
            } else if ready.is_empty() {
                RoutePlan::Finish(format!(
                    "no runnable stages remain (proposal '{stage}' rejected)"
                ))
            } else {
                RoutePlan::Run(ready)
            }
        }
    }
}

/// An external decision-maker proposing one routing step at a time.
#[async_trait]
pub trait RoutePlanner: Send + Sync {
    /// Returns the raw wire payload of a routing decision. Errors here are
    /// infrastructure failures; content problems are the decoder's job.
    async fn propose(&self, state: &PipelineState) -> Result<String, AppError>;
}

/// How the orchestrator decides its next step.
#[derive(Clone)]
pub enum RoutingStrategy {
    Deterministic,
    Delegated(Arc<dyn RoutePlanner>),
}

const ROUTER_SYSTEM_PROMPT: &str = "You route a contract analysis pipeline. \
    The stages and their prerequisites are: summarize (none), explain_clauses (none), \
    assess_risk (summarize and explain_clauses), generate_report (assess_risk). \
    Pick the next stage that has not run and whose prerequisites are complete, or \
    TERMINAL when nothing useful remains. Respond with exactly one JSON object \
    {\"next_stage\": ..., \"reason\": ...} and no other text.";

/// Model-backed routing for the delegated strategy.
pub struct LlmRoutePlanner {
    openai_client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl LlmRoutePlanner {
    pub fn new(openai_client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            openai_client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl RoutePlanner for LlmRoutePlanner {
    async fn propose(&self, state: &PipelineState) -> Result<String, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Pipeline routing decision".into()),
                name: "routing_decision".into(),
                schema: Some(routing_decision_schema()),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(ROUTER_SYSTEM_PROMPT.to_owned()).into(),
                ChatCompletionRequestUserMessage::from(progress_digest(state)).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.openai_client.chat().create(request).await?;
        response_text(response)
    }
}

fn routing_decision_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "next_stage": {
                "type": "string",
                "enum": [
                    "summarize",
                    "explain_clauses",
                    "assess_risk",
                    "generate_report",
                    "TERMINAL"
                ]
            },
            "reason": { "type": "string" }
        },
        "required": ["next_stage", "reason"],
        "additionalProperties": false
    })
}

fn progress_digest(state: &PipelineState) -> String {
    let completed: Vec<&str> = state
        .outputs
        .keys()
        .map(|stage| stage.as_str())
        .collect();
    let pending: Vec<&str> = StageId::ALL
        .into_iter()
        .filter(|stage| !state.has(*stage))
        .map(StageId::as_str)
        .collect();

    format!(
        r"
        Document:
        ==================
        {}

        Completed stages:
        ==================
        {}

        Pending stages:
        ==================
        {}
        ",
        state.file_name,
        if completed.is_empty() {
            "(none)".to_owned()
        } else {
            completed.join(", ")
        },
        if pending.is_empty() {
            "(none)".to_owned()
        } else {
            pending.join(", ")
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::{
        ClausesOutput, ReportOutput, RiskOutput, StageOutput, SummaryOutput,
    };

    fn ingested() -> PipelineState {
        PipelineState::new("lease.pdf", "lease.pdf", "Full contract text.", None)
    }

    fn with_outputs(stages: &[StageId]) -> PipelineState {
        let mut state = ingested();
        for stage in stages {
            state.insert_output(*stage, canned_output(*stage));
        }
        state
    }

    fn canned_output(stage: StageId) -> StageOutput {
        match stage {
            StageId::Summarize => StageOutput::Summarize(SummaryOutput {
                summary: "s".into(),
                key_points: vec![],
                detailed_explanation: "d".into(),
            }),
            StageId::ExplainClauses => StageOutput::ExplainClauses(ClausesOutput {
                simplified_clauses: vec![],
            }),
            StageId::AssessRisk => StageOutput::AssessRisk(RiskOutput {
                overall_risk_level: "low".into(),
                overall_risk_score: 0.1,
                risks: vec![],
                assumptions_or_uncertainties: vec![],
            }),
            StageId::GenerateReport => StageOutput::GenerateReport(ReportOutput {
                report_markdown: "# r".into(),
                highlights: vec![],
                file_name: "lease.pdf".into(),
                overall_risk_level: "low".into(),
                overall_risk_score: 0.1,
                risks_count: 0,
            }),
        }
    }

    #[test]
    fn ready_set_follows_the_precedence_table() {
        assert_eq!(
            ready_stages(&ingested()),
            [StageId::Summarize, StageId::ExplainClauses]
        );
        assert_eq!(
            ready_stages(&with_outputs(&[StageId::Summarize])),
            [StageId::ExplainClauses]
        );
        assert_eq!(
            ready_stages(&with_outputs(&[StageId::Summarize, StageId::ExplainClauses])),
            [StageId::AssessRisk]
        );
        assert_eq!(
            ready_stages(&with_outputs(&[
                StageId::Summarize,
                StageId::ExplainClauses,
                StageId::AssessRisk
            ])),
            [StageId::GenerateReport]
        );
        assert!(ready_stages(&with_outputs(&StageId::ALL)).is_empty());
    }

    #[test]
    fn deterministic_plan_finishes_when_nothing_is_ready() {
        match deterministic_plan(&with_outputs(&StageId::ALL)) {
            RoutePlan::Finish(reason) => assert!(reason.contains("no runnable")),
            other => panic!("expected finish, got {other:?}"),
        }
        assert_eq!(
            deterministic_plan(&ingested()),
            RoutePlan::Run(vec![StageId::Summarize, StageId::ExplainClauses])
        );
    }

    #[test]
    fn wire_decode_accepts_stages_and_terminal() {
        let decision =
            RoutingDecision::from_wire(r#"{"next_stage": "assess_risk", "reason": "ready"}"#);
        assert_eq!(decision.target, RouteTarget::Stage(StageId::AssessRisk));
        assert_eq!(decision.reason, "ready");

        let decision =
            RoutingDecision::from_wire(r#"{"next_stage": "TERMINAL", "reason": "done"}"#);
        assert_eq!(decision.target, RouteTarget::Terminal);
    }

    #[test]
    fn malformed_payloads_always_decode_to_terminal() {
        for payload in [
            "not json",
            "42",
            r#"["next_stage", "summarize"]"#,
            r#"{"reason": "no stage named"}"#,
            r#"{"next_stage": "bogus_stage", "reason": "made up"}"#,
        ] {
            let decision = RoutingDecision::from_wire(payload);
            assert_eq!(
                decision.target,
                RouteTarget::Terminal,
                "payload {payload:?} must degrade to terminal"
            );
        }
    }

    #[test]
    fn legal_delegated_proposal_runs_alone() {
        let state = with_outputs(&[StageId::Summarize, StageId::ExplainClauses]);
        let decision = RoutingDecision::from_wire(
            r#"{"next_stage": "assess_risk", "reason": "both inputs ready"}"#,
        );
        assert_eq!(
            validate_delegated(&decision, &state),
            RoutePlan::Run(vec![StageId::AssessRisk])
        );
    }

    #[test]
    fn premature_proposal_is_rerouted_to_the_ready_set() {
        let state = ingested();
        let decision = RoutingDecision::from_wire(
            r#"{"next_stage": "assess_risk", "reason": "eager"}"#,
        );
        assert_eq!(
            validate_delegated(&decision, &state),
            RoutePlan::Run(vec![StageId::Summarize, StageId::ExplainClauses])
        );
    }

    #[test]
    fn proposal_after_completion_finishes() {
        let state = with_outputs(&StageId::ALL);
        let decision = RoutingDecision::from_wire(
            r#"{"next_stage": "summarize", "reason": "again"}"#,
        );
        match validate_delegated(&decision, &state) {
            RoutePlan::Finish(reason) => assert!(reason.contains("summarize")),
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn progress_digest_lists_completed_and_pending() {
        let digest = progress_digest(&with_outputs(&[StageId::Summarize]));
        assert!(digest.contains("summarize"));
        assert!(digest.contains("explain_clauses"));
        assert!(digest.contains("lease.pdf"));
    }
}
