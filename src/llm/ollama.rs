//! Ollama-compatible `/api/generate` transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{GenerateRequest, InferenceTransport};

/// Maximum response body kept in an error message.
const ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// HTTP transport for a local or remote Ollama-style server.
pub struct OllamaTransport {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OllamaTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Builder: send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl InferenceTransport for OllamaTransport {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn send(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: false,
            options: GenerateOptions {
                num_predict: request.max_tokens,
            },
        };

        let mut builder = self.client.post(self.endpoint()).timeout(timeout).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    model: request.model.clone(),
                    timeout,
                }
            } else {
                LlmError::RequestFailed {
                    model: request.model.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    model: request.model.clone(),
                    timeout,
                }
            } else {
                LlmError::RequestFailed {
                    model: request.model.clone(),
                    reason: format!("Failed to read body: {e}"),
                }
            }
        })?;

        if !status.is_success() {
            return Err(LlmError::HttpStatus {
                model: request.model.clone(),
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                model: request.model.clone(),
                reason: e.to_string(),
            })?;

        if parsed.response.trim().is_empty() {
            return Err(LlmError::EmptyResponse {
                model: request.model.clone(),
            });
        }
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trims_trailing_slash() {
        let transport = OllamaTransport::new("http://localhost:11434/");
        assert_eq!(transport.endpoint(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn body_omits_missing_system() {
        let body = GenerateBody {
            model: "m",
            prompt: "p",
            system: None,
            stream: false,
            options: GenerateOptions { num_predict: 64 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 64);
    }

    #[test]
    fn response_field_defaults_to_empty() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(parsed.response.is_empty());
    }
}
