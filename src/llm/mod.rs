//! AI text generation used by the story pipeline.

mod openai;

pub use openai::OpenAITextGenerator;

use crate::error::ServiceError;
use async_trait::async_trait;

/// A single chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Short label identifying the caller (the pipeline step name), used in logs.
    pub label: String,
    pub system: String,
    pub user: String,
}

/// Trait for text generation services.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Complete one prompt and return the raw response text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError>;
}
