//! HTTP adapters for the embedding and LLM providers.

pub mod embedding;
pub mod llm;

pub use embedding::EmbeddingClient;
pub use llm::{LlmClient, ModelTier};
