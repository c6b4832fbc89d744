use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Which routing strategy the analysis pipeline uses to pick the next stage.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Deterministic,
    Delegated,
}

fn default_routing_mode() -> RoutingMode {
    RoutingMode::Deterministic
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_ingest_batch_size")]
    pub ingest_batch_size: usize,
    #[serde(default = "default_qa_top_k")]
    pub qa_top_k: usize,
    #[serde(default = "default_qa_max_history")]
    pub qa_max_history: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_ingest_step_timeout_secs")]
    pub ingest_step_timeout_secs: u64,
    #[serde(default = "default_stage_input_char_cap")]
    pub stage_input_char_cap: usize,
    #[serde(default = "default_max_routing_steps")]
    pub max_routing_steps: usize,
    #[serde(default = "default_routing_mode")]
    pub routing_mode: RoutingMode,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_ingest_batch_size() -> usize {
    100
}

fn default_qa_top_k() -> usize {
    6
}

fn default_qa_max_history() -> usize {
    10
}

fn default_stage_timeout_secs() -> u64 {
    120
}

fn default_search_timeout_secs() -> u64 {
    30
}

fn default_ingest_step_timeout_secs() -> u64 {
    60
}

fn default_stage_input_char_cap() -> usize {
    20_000
}

fn default_max_routing_steps() -> usize {
    16
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Configuration for offline tests: no live services, defaults everywhere.
    pub fn for_tests() -> Self {
        Self {
            openai_api_key: "test-key".to_string(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "test".to_string(),
            surrealdb_database: "test".to_string(),
            openai_base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            ingest_batch_size: default_ingest_batch_size(),
            qa_top_k: default_qa_top_k(),
            qa_max_history: default_qa_max_history(),
            stage_timeout_secs: default_stage_timeout_secs(),
            search_timeout_secs: default_search_timeout_secs(),
            ingest_step_timeout_secs: default_ingest_step_timeout_secs(),
            stage_input_char_cap: default_stage_input_char_cap(),
            max_routing_steps: default_max_routing_steps(),
            routing_mode: default_routing_mode(),
        }
    }
}
