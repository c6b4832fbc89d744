use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error vocabulary shared by the ingestion, analysis, and retrieval crates.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("database failure: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("document produced no text: {0}")]
    EmptyDocument(String),
    #[error("malformed stage output: {0}")]
    MalformedOutput(String),
    #[error("partial ingestion: stored {stored} of {total} chunks")]
    PartialIngestion { stored: usize, total: usize },
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("model invocation failed: {0}")]
    InvocationFailure(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("task join failure: {0}")]
    Join(#[from] JoinError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Collapses a timeout on an external model call into the invocation
    /// failure the callers handle, keeping the budget visible in the message.
    pub fn invocation_timeout(what: &str, secs: u64) -> Self {
        Self::InvocationFailure(format!("{what} timed out after {secs}s"))
    }
}
