//! Field inference: extracted text → raw model answer.
//!
//! This module only gets an answer out of the model. Turning that answer into
//! [`crate::record::FinancialFields`] is [`crate::pipeline::parse`]'s job, so
//! prompt changes and parser changes never touch each other.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::prompts::{analysis_request, FINANCIAL_SYSTEM_PROMPT, JSON_OBJECT_HINT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Asks a language model to read financial fields out of document text.
#[async_trait]
pub trait FieldInference: Send + Sync {
    /// Send `text` under the financial-extraction instructions and return
    /// the model's raw answer, which is expected to be a single JSON object.
    async fn infer(&self, text: &str) -> Result<String, AnalysisError>;
}

/// [`FieldInference`] over any `edgequake_llm` provider.
pub struct LlmFieldInference {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    max_text_chars: usize,
}

impl LlmFieldInference {
    /// Build from config, resolving the provider as [`resolve_provider`] does.
    pub fn from_config(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let provider = resolve_provider(config)?;
        Ok(Self::with_provider(provider, config))
    }

    /// Build around an already constructed provider.
    pub fn with_provider(provider: Arc<dyn LLMProvider>, config: &AnalysisConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| FINANCIAL_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_text_chars: config.max_text_chars,
        }
    }

    fn messages(&self, text: &str) -> Vec<ChatMessage> {
        let request = analysis_request(truncate_chars(text, self.max_text_chars));
        vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::system(JSON_OBJECT_HINT),
            ChatMessage::user(&request),
        ]
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl FieldInference for LlmFieldInference {
    async fn infer(&self, text: &str) -> Result<String, AnalysisError> {
        let start = Instant::now();
        let messages = self.messages(text);
        let options = self.options();

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| AnalysisError::InferenceFailed {
                reason: e.to_string(),
            })?;

        debug!(
            "Inference: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        if response.content.trim().is_empty() {
            return Err(AnalysisError::InferenceFailed {
                reason: "model returned an empty answer".into(),
            });
        }
        Ok(response.content)
    }
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with the configured model.
/// 3. **OpenAI** when `OPENAI_API_KEY` is present, with the configured model.
/// 4. **Auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_provider(config: &AnalysisConfig) -> Result<Arc<dyn LLMProvider>, AnalysisError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model_or_default();
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        AnalysisError::InvalidConfig(format!(
            "no LLM provider could be detected from the environment; \
             set OPENAI_API_KEY or DOC2FIN_PROVIDER ({e})"
        ))
    })?;
    info!("Using auto-detected LLM provider");
    Ok(provider)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, AnalysisError> {
    info!("Using LLM provider '{}' with model '{}'", name, model);
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        AnalysisError::InvalidConfig(format!("LLM provider '{name}' is not configured: {e}"))
    })
}
