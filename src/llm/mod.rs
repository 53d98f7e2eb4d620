//! LLM integration for the dispatcher.
//!
//! Phases talk to [`LlmGateway`], which wraps an [`InferenceTransport`] in a
//! [`RetryPolicy`]: bounded attempts with exponential backoff, then one
//! attempt at a same-family fallback model.

pub mod gateway;
pub mod ollama;
pub mod provider;
pub mod retry;

pub use gateway::LlmGateway;
pub use ollama::OllamaTransport;
pub use provider::{GenerateRequest, InferenceTransport};
pub use retry::{FallbackTable, RetryPolicy, call_with_policy};

use std::sync::Arc;

use crate::config::GatewayConfig;

/// Create the HTTP-backed gateway from configuration.
pub fn create_gateway(config: &GatewayConfig) -> LlmGateway {
    let mut transport = OllamaTransport::new(&config.base_url);
    if let Some(ref key) = config.api_key {
        transport = transport.with_api_key(key.clone());
    }

    let policy = RetryPolicy::new(config.max_attempts, config.backoff_base, config.timeout)
        .with_fallbacks(config.fallbacks.clone());

    tracing::info!(
        url = %config.base_url,
        attempts = policy.max_attempts(),
        fallbacks = policy.fallbacks().len(),
        "Using Ollama-compatible inference endpoint"
    );
    LlmGateway::new(Arc::new(transport), policy)
}
