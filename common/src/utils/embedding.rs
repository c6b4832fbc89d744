use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, EmbeddingInput},
    Client,
};

use crate::error::AppError;

/// Produces the vectors stored in and queried against the vector index.
///
/// The OpenAI backend is the live path; the hashed backend is deterministic
/// and offline, which lets the whole stack run against an in-memory database
/// in tests. Both backends emit vectors of a fixed, known dimension.
#[derive(Clone)]
pub struct EmbeddingProvider {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Api(ApiBackend),
    Hashed { dimension: usize },
}

#[derive(Clone)]
struct ApiBackend {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    dimensions: u32,
}

impl ApiBackend {
    async fn fetch<I>(&self, input: I) -> Result<Vec<Vec<f32>>, AppError>
    where
        I: Into<EmbeddingInput>,
    {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.as_str())
            .dimensions(self.dimensions)
            .input(input)
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        Ok(response
            .data
            .into_iter()
            .map(|item| item.embedding)
            .collect())
    }
}

impl EmbeddingProvider {
    pub fn new_openai(
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            backend: Backend::Api(ApiBackend {
                client,
                model,
                dimensions,
            }),
        }
    }

    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            backend: Backend::Hashed {
                dimension: dimension.max(1),
            },
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            Backend::Hashed { .. } => "hashed",
            Backend::Api(..) => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.backend {
            Backend::Hashed { dimension } => *dimension,
            Backend::Api(api) => api.dimensions as usize,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        match &self.backend {
            Backend::Hashed { dimension } => Ok(token_bucket_vector(text, *dimension)),
            Backend::Api(api) => {
                let mut vectors = api.fetch([text]).await?;
                vectors.pop().ok_or_else(|| {
                    AppError::InternalError("embeddings response carried no vector".into())
                })
            }
        }
    }

    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.backend {
            Backend::Hashed { dimension } => {
                let width = *dimension;
                Ok(texts
                    .iter()
                    .map(|text| token_bucket_vector(text, width))
                    .collect())
            }
            Backend::Api(api) => api.fetch(texts).await,
        }
    }
}

/// Buckets lowercased alphanumeric tokens into a fixed-width vector and
/// L2-normalizes the counts, so identical text always embeds identically.
fn token_bucket_vector(text: &str, dimension: usize) -> Vec<f32> {
    let width = dimension.max(1);
    let mut buckets = vec![0.0f32; width];

    for token in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        let mut hasher = DefaultHasher::new();
        token.to_ascii_lowercase().hash(&mut hasher);
        buckets[hasher.finish() as usize % width] += 1.0;
    }

    let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut buckets {
            *value /= norm;
        }
    }

    buckets
}
