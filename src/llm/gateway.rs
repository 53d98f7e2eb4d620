//! The gateway every phase calls to generate text.

use std::sync::Arc;

use crate::llm::provider::{GenerateRequest, InferenceTransport};
use crate::llm::retry::{RetryPolicy, call_with_policy};

/// Generation entry point: a transport plus the default retry policy.
///
/// `generate` never fails; exhaustion is reported as an empty string and the
/// caller decides what emptiness means.
#[derive(Clone)]
pub struct LlmGateway {
    transport: Arc<dyn InferenceTransport>,
    policy: RetryPolicy,
}

impl LlmGateway {
    pub fn new(transport: Arc<dyn InferenceTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Generate under the gateway's default policy.
    pub async fn generate(&self, request: &GenerateRequest) -> String {
        self.generate_with(request, &self.policy).await
    }

    /// Generate under an explicit policy.
    pub async fn generate_with(&self, request: &GenerateRequest, policy: &RetryPolicy) -> String {
        tracing::debug!(
            transport = self.transport.name(),
            model = %request.model,
            prompt_chars = request.prompt.len(),
            "Generating"
        );
        call_with_policy(self.transport.as_ref(), request, policy).await
    }
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("transport", &self.transport.name())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::retry::FallbackTable;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceTransport for EchoTransport {
        fn name(&self) -> &str {
            "echo"
        }

        async fn send(
            &self,
            request: &GenerateRequest,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}: {}", request.model, request.prompt))
        }
    }

    #[tokio::test]
    async fn generate_uses_transport() {
        let transport = Arc::new(EchoTransport {
            calls: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(
            transport.clone(),
            RetryPolicy::new(1, 0.0, Duration::from_secs(1)).with_fallbacks(FallbackTable::empty()),
        );

        let out = gateway
            .generate(&GenerateRequest::new("m", "hi").with_system("sys"))
            .await;
        assert_eq!(out, "m: hi");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
