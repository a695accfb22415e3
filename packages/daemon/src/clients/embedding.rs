//! Embedding provider client using direct HTTP calls.
//!
//! One client shape covers all three providers; ollama speaks its native
//! batch endpoint, vllm and openai speak the OpenAI-compatible
//! `/v1/embeddings` surface.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingsConfig, Provider};

// Request/response types for the provider APIs

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for the configured embedding provider.
pub struct EmbeddingClient {
    client: Client,
    provider: Provider,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingsConfig) -> Result<Self> {
        let provider_config = config
            .provider_config()
            .ok_or_else(|| anyhow!("no provider section for {:?}", config.provider))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            provider: config.provider,
            base_url: provider_config.base_url.trim_end_matches('/').to_string(),
            api_key: provider_config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension as usize,
            batch_size: config.batch_size.max(1),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a batch of texts, preserving input order. Inputs are split
    /// into provider-sized sub-batches.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = match self.provider {
                Provider::Ollama => self.embed_ollama(batch).await?,
                Provider::Vllm | Provider::Openai => self.embed_openai_compatible(batch).await?,
            };
            if vectors.len() != batch.len() {
                return Err(anyhow!(
                    "provider returned {} embeddings for {} inputs",
                    vectors.len(),
                    batch.len()
                ));
            }
            for vector in &vectors {
                if vector.len() != self.dimension {
                    return Err(anyhow!(
                        "embedding dimension {} does not match configured {}",
                        vector.len(),
                        self.dimension
                    ));
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn embed_ollama(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .context("embedding request failed")?
            .error_for_status()
            .context("embedding provider returned an error")?;

        let body: OllamaEmbedResponse = response
            .json()
            .await
            .context("invalid embedding response")?;
        Ok(body.embeddings)
    }

    async fn embed_openai_compatible(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&OpenAiEmbedRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("embedding request failed")?
            .error_for_status()
            .context("embedding provider returned an error")?;

        let body: OpenAiEmbedResponse = response
            .json()
            .await
            .context("invalid embedding response")?;

        let mut data = body.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}
