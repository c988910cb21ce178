//! Outbound sampling: asking the MCP host's LLM to complete a prompt.
//!
//! The AI query generator and the `enhance-description` bulk action both
//! need a model. The server never owns one; it sends a sampling request
//! back to the host over MCP. [`SamplingClient`] is the seam — the rmcp
//! peer implements it in production, and tests substitute a scripted fake.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Model selection preferences attached to a sampling request. The host may
/// ignore them entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPreferences {
    /// Model-name hints, ordered by preference.
    pub hints: Vec<String>,

    /// 0.0–1.0 priorities; higher means more important to the caller.
    pub speed_priority: f32,
    pub cost_priority: f32,
    pub intelligence_priority: f32,
}

impl ModelPreferences {
    /// Query generation wants the fastest adequate model: small hints
    /// first, a mid-size fallback last.
    pub fn speed_first() -> Self {
        Self {
            hints: vec![
                "claude-3-5-haiku".to_string(),
                "gpt-4o-mini".to_string(),
                "claude-sonnet".to_string(),
            ],
            speed_priority: 0.9,
            cost_priority: 0.7,
            intelligence_priority: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingRole {
    User,
    Assistant,
}

/// One conversation turn in a sampling request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: SamplingRole,
    pub content: String,
}

impl SamplingMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: SamplingRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: SamplingRole::Assistant,
            content: content.into(),
        }
    }
}

/// A sampling request to the host.
#[derive(Debug, Clone)]
pub struct SamplingRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<SamplingMessage>,
    pub max_tokens: u32,
    pub model_preferences: Option<ModelPreferences>,
    pub temperature: Option<f64>,
}

impl SamplingRequest {
    pub fn new(messages: Vec<SamplingMessage>) -> Self {
        Self {
            system_prompt: None,
            messages,
            max_tokens: 1024,
            model_preferences: None,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_model_preferences(mut self, preferences: ModelPreferences) -> Self {
        self.model_preferences = Some(preferences);
        self
    }
}

/// Sends sampling requests to the MCP host.
#[async_trait]
pub trait SamplingClient: Send + Sync {
    /// Complete the request, returning the model's text output.
    ///
    /// # Errors
    ///
    /// [`Error::SamplingUnavailable`](crate::Error::SamplingUnavailable)
    /// when the host offers no sampling capability or rejects the request.
    async fn complete(&self, request: SamplingRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_first_preferences_order_small_models_first() {
        let prefs = ModelPreferences::speed_first();
        assert!(prefs.hints.len() >= 2);
        assert!(prefs.hints[0].contains("haiku"));
        assert!(prefs.speed_priority > prefs.intelligence_priority);
    }

    #[test]
    fn test_request_builder() {
        let request = SamplingRequest::new(vec![SamplingMessage::user("hello")])
            .with_system_prompt("be terse")
            .with_max_tokens(256)
            .with_model_preferences(ModelPreferences::speed_first());

        assert_eq!(request.max_tokens, 256);
        assert_eq!(request.system_prompt.as_deref(), Some("be terse"));
        assert_eq!(request.messages[0].role, SamplingRole::User);
    }
}
