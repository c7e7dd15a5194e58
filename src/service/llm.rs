//! [`ChatService`] over an `edgequake-llm` provider.
//!
//! ## Provider resolution
//!
//! From most to least specific:
//!
//! 1. The section's `provider` setting (`"openai"`, `"anthropic"`, ...)
//! 2. `EDGEQUAKE_LLM_PROVIDER` from the environment
//! 3. Inferred from the model id (`gpt-*` → openai, `claude-*` → anthropic,
//!    `gemini-*` → gemini)
//! 4. `ProviderFactory::from_env()` auto-detection
//!
//! The key named by the section's `api_key_env` is handed to the provider
//! directly for the hosted families (openai, anthropic, gemini, openrouter).
//! Other providers read their own environment variables.

use super::{ChatReply, ChatRequest, ChatService};
use crate::error::{ConfigError, ServiceError};
use async_trait::async_trait;
use edgequake_llm::{
    AnthropicProvider, ChatMessage, CompletionOptions, GeminiProvider, LLMProvider, OpenAIProvider,
    OpenRouterProvider, ProviderFactory, ProviderType,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Chat completions through any `edgequake-llm` provider.
pub struct LlmChatService {
    provider: Arc<dyn LLMProvider>,
    model: String,
    timeout: Duration,
}

impl LlmChatService {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Resolve a provider for `model` and wrap it. `api_key` is the value
    /// already read from the section's `api_key_env`.
    pub fn from_settings(
        provider_name: Option<&str>,
        model: &str,
        api_key: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(resolve_provider(provider_name, model, api_key)?, model))
    }

    /// Per-call timeout. Default: 60 s.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ChatService for LlmChatService {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ServiceError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        messages.push(ChatMessage::user(request.prompt.as_str()));

        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let call = self.provider.chat(&messages, Some(&options));
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ServiceError::from_message(e.to_string())),
            Err(_) => {
                return Err(ServiceError::Timeout(format!(
                    "{} did not answer within {}s",
                    self.model,
                    self.timeout.as_secs()
                )))
            }
        };

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.model, response.prompt_tokens, response.completion_tokens
        );
        Ok(ChatReply {
            content: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}

/// Resolve the LLM provider, from most-specific to least-specific.
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, ConfigError> {
    if let Some(name) = provider_name.filter(|n| !n.is_empty()) {
        return create_provider(name, model, api_key);
    }

    if let Ok(name) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !name.is_empty() {
            return create_provider(&name, model, api_key);
        }
    }

    if let Some(name) = infer_provider(model) {
        return create_provider(name, model, api_key);
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| ConfigError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected for model '{model}'.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or a `provider` in the config.\n\
                 Error: {e}"
            ),
        })?;
    Ok(llm)
}

fn create_provider(
    name: &str,
    model: &str,
    api_key: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, ConfigError> {
    if let Some(provider) = api_key.and_then(|key| keyed_provider(name, model, key)) {
        return Ok(provider);
    }
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        ConfigError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Providers that accept an explicit key.
fn keyed_provider(name: &str, model: &str, key: &str) -> Option<Arc<dyn LLMProvider>> {
    let provider: Arc<dyn LLMProvider> = match ProviderType::from_str(name)? {
        ProviderType::OpenAI => Arc::new(OpenAIProvider::new(key).with_model(model)),
        ProviderType::Anthropic => Arc::new(AnthropicProvider::new(key).with_model(model)),
        ProviderType::Gemini => Arc::new(GeminiProvider::new(key).with_model(model)),
        ProviderType::OpenRouter => Arc::new(OpenRouterProvider::new(key).with_model(model)),
        _ => return None,
    };
    Some(provider)
}

/// Guess the provider family from a model id.
fn infer_provider(model: &str) -> Option<&'static str> {
    let m = model.to_ascii_lowercase();
    if m.starts_with("gpt-") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") {
        Some("openai")
    } else if m.starts_with("claude") {
        Some("anthropic")
    } else if m.starts_with("gemini") {
        Some("gemini")
    } else {
        None
    }
}
