//! OpenAI chat completion text generator.

use super::{CompletionRequest, TextGenerator};
use crate::config::PipelineSettings;
use crate::error::{Result, ServiceError};
use crate::openai::create_client_with_timeout;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

/// Text generator backed by OpenAI chat completions.
pub struct OpenAITextGenerator {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    temperature: f32,
}

impl OpenAITextGenerator {
    /// Create a generator from the pipeline settings.
    pub fn new(settings: &PipelineSettings) -> Result<Self> {
        let client =
            create_client_with_timeout(Duration::from_secs(settings.request_timeout_secs))?;
        Ok(Self {
            client,
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAITextGenerator {
    #[instrument(skip(self, request), fields(label = %request.label, model = %self.model))]
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, ServiceError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system.clone())
                .build()
                .map_err(|e| ServiceError::Rejected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.user.clone())
                .build()
                .map_err(|e| ServiceError::Rejected(e.to_string()))?
                .into(),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(self.temperature)
            .build()
            .map_err(|e| ServiceError::Rejected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify_openai_error)?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ServiceError::TransientFault("Empty response from LLM".to_string()))?;

        debug!("LLM response: {}", truncate(&content, 500));
        Ok(content)
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Map an OpenAI client error to a service failure.
fn classify_openai_error(err: OpenAIError) -> ServiceError {
    match err {
        OpenAIError::ApiError(api) => {
            let detail = format!(
                "{} {:?} {:?}",
                api.message, api.r#type, api.code
            )
            .to_lowercase();
            if detail.contains("rate_limit") || detail.contains("rate limit") {
                ServiceError::RateLimited(api.message)
            } else if detail.contains("server_error") || detail.contains("overloaded") {
                ServiceError::TransientFault(api.message)
            } else {
                ServiceError::Rejected(api.message)
            }
        }
        OpenAIError::Reqwest(e) => ServiceError::TransientFault(e.to_string()),
        OpenAIError::JSONDeserialize(e) => {
            ServiceError::TransientFault(format!("malformed response: {}", e))
        }
        other => ServiceError::Rejected(other.to_string()),
    }
}
