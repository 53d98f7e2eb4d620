//! Inference transport trait and request type.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;

/// Default generation budget when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// A single generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Same request against a different model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// One HTTP round-trip to a generation endpoint.
///
/// Implementations make exactly one attempt per call; retry and fallback
/// live in the gateway.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &str;

    /// Send the request, giving up after `timeout`.
    async fn send(&self, request: &GenerateRequest, timeout: Duration)
    -> Result<String, LlmError>;
}
