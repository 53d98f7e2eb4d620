//! Retry policy: bounded attempts, exponential backoff, one fallback model.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::LlmError;
use crate::llm::provider::{GenerateRequest, InferenceTransport};

/// Built-in model → smaller sibling mapping.
const DEFAULT_FALLBACKS: &[(&str, &str)] = &[
    ("llama3.1:70b", "llama3.1:8b"),
    ("qwen2.5:32b", "qwen2.5:7b"),
    ("mixtral:8x7b", "mistral:7b"),
    ("deepseek-r1:32b", "deepseek-r1:8b"),
];

/// Table of same-capability fallback models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTable {
    entries: HashMap<String, String>,
}

impl FallbackTable {
    /// A table with no fallbacks.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add or replace a mapping.
    pub fn with(mut self, model: impl Into<String>, fallback: impl Into<String>) -> Self {
        self.entries.insert(model.into(), fallback.into());
        self
    }

    /// Apply `model=fallback,model=fallback` overrides on top of this table.
    pub fn with_overrides(mut self, spec: &str) -> Result<Self, String> {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (model, fallback) = entry
                .split_once('=')
                .map(|(m, f)| (m.trim(), f.trim()))
                .filter(|(m, f)| !m.is_empty() && !f.is_empty())
                .ok_or_else(|| format!("expected model=fallback, got '{entry}'"))?;
            self.entries.insert(model.to_string(), fallback.to_string());
        }
        Ok(self)
    }

    /// The fallback for `model`, if one is configured and differs from it.
    pub fn fallback_for(&self, model: &str) -> Option<&str> {
        self.entries
            .get(model)
            .map(String::as_str)
            .filter(|fallback| *fallback != model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FallbackTable {
    fn default() -> Self {
        DEFAULT_FALLBACKS
            .iter()
            .fold(Self::empty(), |table, (model, fallback)| {
                table.with(*model, *fallback)
            })
    }
}

/// How a generation call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: f64,
    timeout: Duration,
    fallbacks: FallbackTable,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff_base: f64, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            timeout,
            fallbacks: FallbackTable::default(),
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: FallbackTable) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn fallbacks(&self) -> &FallbackTable {
        &self.fallbacks
    }

    /// Delay after the `attempt`-th failed primary attempt: `base^attempt` seconds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_base.powi(exponent);
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2.0, Duration::from_secs(300))
    }
}

/// One bounded attempt; an empty body counts as a failure.
async fn attempt(
    transport: &dyn InferenceTransport,
    request: &GenerateRequest,
    timeout: Duration,
) -> Result<String, LlmError> {
    let text = match tokio::time::timeout(timeout, transport.send(request, timeout)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(LlmError::Timeout {
                model: request.model.clone(),
                timeout,
            });
        }
    };
    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse {
            model: request.model.clone(),
        });
    }
    Ok(text)
}

/// Run `request` under `policy`.
///
/// Makes up to `max_attempts` attempts at the requested model, sleeping
/// `base^k` seconds between them, then exactly one attempt at the configured
/// fallback. Returns an empty string when everything failed.
pub async fn call_with_policy(
    transport: &dyn InferenceTransport,
    request: &GenerateRequest,
    policy: &RetryPolicy,
) -> String {
    for n in 1..=policy.max_attempts {
        match attempt(transport, request, policy.timeout).await {
            Ok(text) => {
                tracing::debug!(model = %request.model, attempt = n, "Generation succeeded");
                return text;
            }
            Err(e) => {
                tracing::warn!(
                    model = %request.model,
                    attempt = n,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Generation attempt failed"
                );
            }
        }
        if n < policy.max_attempts {
            let delay = policy.backoff_delay(n);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    let Some(fallback) = policy.fallbacks.fallback_for(&request.model) else {
        tracing::error!(model = %request.model, "Generation failed; no fallback model configured");
        return String::new();
    };

    tracing::warn!(
        model = %request.model,
        fallback,
        "Primary model exhausted, trying fallback"
    );
    let fallback_request = request.clone().with_model(fallback);
    match attempt(transport, &fallback_request, policy.timeout).await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(model = %fallback, error = %e, "Fallback generation failed");
            String::new()
        }
    }
}
