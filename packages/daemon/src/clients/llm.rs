//! LLM client for summary generation.
//!
//! Two model tiers share one endpoint: the small model handles per-file and
//! per-symbol batches, the deep model handles comprehensive reviews.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, Provider};

/// Which of the configured model pair to use for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Small,
    Deep,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

pub struct LlmClient {
    client: Client,
    provider: Provider,
    base_url: String,
    api_key: Option<String>,
    small_model: String,
    deep_model: String,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build LLM HTTP client")?;

        Ok(Self {
            client,
            provider: config.provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            small_model: config.small_model.clone(),
            deep_model: config.deep_model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn model_name(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Small => &self.small_model,
            ModelTier::Deep => &self.deep_model,
        }
    }

    /// Generate a completion for the prompt with the given model tier.
    pub async fn generate(&self, tier: ModelTier, prompt: &str) -> Result<String> {
        let model = self.model_name(tier);
        match self.provider {
            Provider::Ollama => self.generate_ollama(model, prompt).await,
            Provider::Vllm | Provider::Openai => self.generate_chat(model, prompt).await,
        }
    }

    async fn generate_ollama(&self, model: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&OllamaGenerateRequest {
                model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM provider returned an error")?;

        let body: OllamaGenerateResponse =
            response.json().await.context("invalid LLM response")?;
        Ok(body.response)
    }

    async fn generate_chat(&self, model: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM provider returned an error")?;

        let body: ChatResponse = response.json().await.context("invalid LLM response")?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("LLM returned no choices"))
    }
}
