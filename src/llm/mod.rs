pub mod gemini;

use async_trait::async_trait;
use thiserror::Error;

pub use gemini::{LlmClient, LlmConfig};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing model api key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: String },
}

/// Sampling bounds for structured output. Kept conservative so repeated
/// runs over the same product stay close to each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub parts: Vec<Part>,
    pub sampling: Sampling,
}

/// A generative model that answers a multi-part prompt with text.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError>;
}
