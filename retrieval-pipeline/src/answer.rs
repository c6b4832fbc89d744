use std::{future::Future, sync::Arc, time::Duration};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::{
    error::AppError,
    storage::index::{RetrievedChunk, VectorIndex},
    utils::{config::AppConfig, embedding::EmbeddingProvider, llm::response_text},
};
use tokio::time::timeout;
use tracing::warn;

use crate::{scope::scope, session::ConversationHistory};

const GROUNDED_SYSTEM_PROMPT: &str = "You answer questions about one legal document. \
    Answer only from the excerpts in CONTEXT. If the context does not support an \
    answer, say you do not know. Quote numeric figures (amounts, dates, deadlines, \
    percentages) verbatim from the context. If a clause allows more than one reading, \
    list every interpretation. Keep follow-up answers consistent with the chat history.";

const UNGROUNDED_SYSTEM_PROMPT: &str = "You answer questions about one legal document, \
    but no excerpts from it are available for this question. Answer from general \
    knowledge, say that you could not consult the document, and do not invent \
    document-specific figures.";

/// Prefixed to any answer produced without document context, and repeated in
/// the caveat list. Callers always get an answer; this is how they learn it
/// is ungrounded.
pub const UNGROUNDED_WARNING: &str =
    "Retrieval is unavailable; answering without document grounding.";

/// Knobs for one QA session. Defaults mirror the configuration defaults.
#[derive(Debug, Clone)]
pub struct QaTuning {
    pub top_k: usize,
    pub max_history: usize,
    pub search_timeout: Duration,
    pub answer_timeout: Duration,
}

impl Default for QaTuning {
    fn default() -> Self {
        Self {
            top_k: 6,
            max_history: 10,
            search_timeout: Duration::from_secs(30),
            answer_timeout: Duration::from_secs(120),
        }
    }
}

impl QaTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            top_k: config.qa_top_k,
            max_history: config.qa_max_history,
            search_timeout: Duration::from_secs(config.search_timeout_secs),
            answer_timeout: Duration::from_secs(config.stage_timeout_secs),
        }
    }
}

/// A completed QA turn. `caveats` lists every disclosed degradation that went
/// into the answer: scope fallbacks, failed corpus searches, ungrounded
/// answering.
#[derive(Debug, Clone)]
pub struct QaAnswer {
    pub answer: String,
    pub caveats: Vec<String>,
}

/// External collaborators of a QA session: the two corpus searches and the
/// model call. One seam so sessions can be exercised without a database or
/// network.
#[async_trait]
pub trait QaServices: Send + Sync {
    async fn search_raw(&self, question: &str, k: usize)
        -> Result<Vec<RetrievedChunk>, AppError>;

    /// Searches the analysis corpus. Implementations without one configured
    /// return an empty result rather than an error.
    async fn search_analysis(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, AppError>;

    async fn complete(&self, system: &str, user: &str) -> Result<String, AppError>;
}

pub struct DefaultQaServices {
    openai_client: Arc<Client<OpenAIConfig>>,
    chat_model: String,
    embedding_provider: Arc<EmbeddingProvider>,
    raw_index: VectorIndex,
    analysis_index: Option<VectorIndex>,
}

impl DefaultQaServices {
    pub fn new(
        openai_client: Arc<Client<OpenAIConfig>>,
        chat_model: impl Into<String>,
        embedding_provider: Arc<EmbeddingProvider>,
        raw_index: VectorIndex,
        analysis_index: Option<VectorIndex>,
    ) -> Self {
        Self {
            openai_client,
            chat_model: chat_model.into(),
            embedding_provider,
            raw_index,
            analysis_index,
        }
    }
}

#[async_trait]
impl QaServices for DefaultQaServices {
    async fn search_raw(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let embedding = self.embedding_provider.embed(question).await?;
        self.raw_index.search(embedding, k).await
    }

    async fn search_analysis(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let Some(index) = self.analysis_index.as_ref() else {
            return Ok(Vec::new());
        };

        let embedding = self.embedding_provider.embed(question).await?;
        index.search(embedding, k).await
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system.to_owned()).into(),
                ChatCompletionRequestUserMessage::from(user.to_owned()).into(),
            ])
            .build()?;

        let response = self.openai_client.chat().create(request).await?;
        response_text(response)
    }
}

/// One question/answer session over one document.
///
/// Safe to run concurrently across sessions; within a session the `&mut` on
/// `answer` keeps history mutation single-writer. Search and model failures
/// are absorbed into the answer's caveats, never returned as errors.
pub struct QaEngine {
    services: Arc<dyn QaServices>,
    doc_id: Option<String>,
    tuning: QaTuning,
    history: ConversationHistory,
}

impl QaEngine {
    pub fn new(services: Arc<dyn QaServices>, doc_id: Option<String>, tuning: QaTuning) -> Self {
        let history = ConversationHistory::new(tuning.max_history);
        Self {
            services,
            doc_id,
            tuning,
            history,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    #[tracing::instrument(skip_all, fields(doc_id = self.doc_id.as_deref().unwrap_or("unscoped")))]
    pub async fn answer(&mut self, question: &str) -> QaAnswer {
        let top_k = self.tuning.top_k;
        let (raw_outcome, analysis_outcome) = tokio::join!(
            bounded_search(
                self.tuning.search_timeout,
                self.services.search_raw(question, top_k),
            ),
            bounded_search(
                self.tuning.search_timeout,
                self.services.search_analysis(question, top_k),
            ),
        );

        let mut caveats = Vec::new();
        let mut search_failed = false;
        let raw_hits = settle_search(
            raw_outcome,
            "Document excerpt search",
            &mut caveats,
            &mut search_failed,
        );
        let analysis_hits = settle_search(
            analysis_outcome,
            "Analysis search",
            &mut caveats,
            &mut search_failed,
        );

        let mut sections = Vec::new();
        if let Some(section) =
            self.scoped_section("Document excerpts:", 'C', "document excerpts", raw_hits, &mut caveats)
        {
            sections.push(section);
        }
        if let Some(section) =
            self.scoped_section("Analysis notes:", 'A', "analysis notes", analysis_hits, &mut caveats)
        {
            sections.push(section);
        }

        let answer = if sections.is_empty() && search_failed {
            self.ungrounded_answer(question, &mut caveats).await
        } else {
            let context = if sections.is_empty() {
                "(no relevant excerpts were found)".to_owned()
            } else {
                sections.join("\n\n")
            };
            let user = grounded_user_message(&self.history_text(), &context, question);
            match self.bounded_complete(GROUNDED_SYSTEM_PROMPT, &user).await {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "grounded answer failed, retrying without context");
                    caveats.push(format!("Grounded answer attempt failed: {err}"));
                    self.ungrounded_answer(question, &mut caveats).await
                }
            }
        };

        self.history.record(question, answer.clone());

        QaAnswer { answer, caveats }
    }

    /// Single context-free attempt. If even this fails the warning itself
    /// becomes the answer, so the caller still receives one.
    async fn ungrounded_answer(&self, question: &str, caveats: &mut Vec<String>) -> String {
        caveats.push(UNGROUNDED_WARNING.to_owned());

        let user = ungrounded_user_message(&self.history_text(), question);
        match self.bounded_complete(UNGROUNDED_SYSTEM_PROMPT, &user).await {
            Ok(text) => format!("{UNGROUNDED_WARNING}\n\n{text}"),
            Err(err) => {
                warn!(error = %err, "context-free answer attempt failed");
                caveats.push(format!("Answer generation failed: {err}"));
                UNGROUNDED_WARNING.to_owned()
            }
        }
    }

    async fn bounded_complete(&self, system: &str, user: &str) -> Result<String, AppError> {
        match timeout(
            self.tuning.answer_timeout,
            self.services.complete(system, user),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::invocation_timeout(
                "answer generation",
                self.tuning.answer_timeout.as_secs(),
            )),
        }
    }

    /// Scopes one corpus result set and renders it as a labeled block.
    /// Empty sets produce no block; a fell-back set is prefixed with the
    /// caveat that also goes to the caller.
    fn scoped_section(
        &self,
        header: &str,
        label: char,
        kind: &str,
        hits: Vec<RetrievedChunk>,
        caveats: &mut Vec<String>,
    ) -> Option<String> {
        if hits.is_empty() {
            return None;
        }

        let outcome = scope(hits, self.doc_id.as_deref());

        let mut section = String::from(header);
        if outcome.fell_back {
            if let Some(doc_id) = self.doc_id.as_deref() {
                let caveat = format!(
                    "None of the retrieved {kind} could be matched to '{doc_id}'; \
                     showing unscoped results."
                );
                section.push_str("\nNote: ");
                section.push_str(&caveat);
                caveats.push(caveat);
            }
        }
        section.push('\n');
        section.push_str(&context_block(label, &outcome.chunks));

        Some(section)
    }

    fn history_text(&self) -> String {
        if self.history.is_empty() {
            "(none)".to_owned()
        } else {
            self.history.render()
        }
    }
}

async fn bounded_search<F>(limit: Duration, search: F) -> Result<Vec<RetrievedChunk>, AppError>
where
    F: Future<Output = Result<Vec<RetrievedChunk>, AppError>>,
{
    match timeout(limit, search).await {
        Ok(outcome) => outcome,
        Err(_) => Err(AppError::RetrievalUnavailable(format!(
            "similarity search timed out after {}s",
            limit.as_secs()
        ))),
    }
}

fn settle_search(
    outcome: Result<Vec<RetrievedChunk>, AppError>,
    what: &str,
    caveats: &mut Vec<String>,
    failed: &mut bool,
) -> Vec<RetrievedChunk> {
    match outcome {
        Ok(hits) => hits,
        Err(err) => {
            warn!(search = what, error = %err, "corpus search failed");
            caveats.push(format!("{what} failed: {err}"));
            *failed = true;
            Vec::new()
        }
    }
}

/// Citation labels are stable within one call ([C1], [C2], ... per block)
/// and restart from 1 on the next call.
fn context_block(label: char, hits: &[RetrievedChunk]) -> String {
    hits.iter()
        .enumerate()
        .map(|(position, hit)| {
            let metadata = &hit.chunk.metadata;
            let provenance = match metadata.page {
                Some(page) => format!("source={} page={page}", metadata.source),
                None => format!("source={}", metadata.source),
            };
            format!(
                "[{label}{}] {provenance}\n{}",
                position.saturating_add(1),
                hit.chunk.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn grounded_user_message(history: &str, context: &str, question: &str) -> String {
    format!(
        r"
        Chat history:
        ==================
        {history}

        CONTEXT:
        ==================
        {context}

        User Question:
        ==================
        {question}
        "
    )
}

fn ungrounded_user_message(history: &str, question: &str) -> String {
    format!(
        r"
        Chat history:
        ==================
        {history}

        User Question:
        ==================
        {question}
        "
    )
}
