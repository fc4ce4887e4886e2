//! HTTP-based embedding providers.
//!
//! Speaks the OpenAI-compatible `/embeddings` API, which OpenAI, Voyage and
//! most self-hosted gateways accept.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::{EmbedError, Embedder};

/// Inferred provider kind from model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Voyage,
    /// Falls back to OpenAI-compatible format.
    Unknown,
}

impl ProviderKind {
    /// Infer provider from model name prefix.
    pub fn from_model(model: &str) -> Self {
        let m = model.to_lowercase();
        if m.starts_with("text-embedding-") {
            Self::OpenAi
        } else if m.starts_with("voyage-") {
            Self::Voyage
        } else {
            Self::Unknown
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi | Self::Unknown => "https://api.openai.com/v1",
            Self::Voyage => "https://api.voyageai.com/v1",
        }
    }

    /// Native output width of well-known models.
    fn default_dimensions(model: &str) -> usize {
        match model {
            "text-embedding-3-large" => 3072,
            "voyage-3" | "voyage-3-large" | "voyage-code-3" => 1024,
            "voyage-3-lite" => 512,
            _ => 1536,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// HTTP embedding provider over an OpenAI-compatible endpoint.
pub struct HttpEmbedder {
    kind: ProviderKind,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmbedder {
    /// Build from model name + API key + optional base URL override.
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        let kind = ProviderKind::from_model(&model);
        let base = base_url.unwrap_or_else(|| kind.default_base_url().to_owned());
        let dimensions = ProviderKind::default_dimensions(&model);
        Self {
            kind,
            model,
            dimensions,
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input,
        };

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    EmbedError::Unavailable(e.to_string())
                } else {
                    EmbedError::RequestFailed(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(check_error(status, text));
        }

        let api: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;

        order_by_index(api.data, input.len())
    }
}

/// Parse error response, returning RateLimited for 429.
fn check_error(status: reqwest::StatusCode, body: String) -> EmbedError {
    match status.as_u16() {
        429 => EmbedError::RateLimited,
        502..=504 => EmbedError::Unavailable(format!("{status}: {body}")),
        _ => EmbedError::RequestFailed(format!("{status}: {body}")),
    }
}

/// The API may return items out of order; `index` maps back to the input slot.
fn order_by_index(data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
    if data.len() != expected {
        return Err(EmbedError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in data {
        match slots.get_mut(item.index) {
            Some(slot) => *slot = Some(item.embedding),
            None => {
                return Err(EmbedError::InvalidResponse(format!(
                    "embedding index {} out of range",
                    item.index
                )));
            }
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| EmbedError::InvalidResponse(format!("missing embedding {i}"))))
        .collect()
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        match self.kind {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Voyage => "voyage",
            ProviderKind::Unknown => "unknown",
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let input = [text.to_owned()];
        self.request(&input)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::InvalidResponse("empty embedding list".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

/// Build an HttpEmbedder for `model` from environment variables.
/// Reads `DRIFTGUARD_EMBED_API_KEY` (falling back to `OPENAI_API_KEY`) and
/// optionally `DRIFTGUARD_EMBED_BASE_URL`; `base_url` wins over the env var.
/// Returns `None` if no key is set.
pub fn from_env(model: &str, base_url: Option<String>) -> Option<HttpEmbedder> {
    let api_key = std::env::var("DRIFTGUARD_EMBED_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .ok()?;
    let base_url = base_url.or_else(|| std::env::var("DRIFTGUARD_EMBED_BASE_URL").ok());
    Some(HttpEmbedder::new(model.to_owned(), api_key, base_url))
}
