//! Gateway-wrapped generation.
//!
//! [`ResilientGenerator`] is the [`TextGenerator`] used in production: every
//! generation goes through the middleware pipeline under the `llm.generate`
//! endpoint (bulkhead, circuit breaker, retry) and participates in the
//! `ollama` cache keyed by the full composite inputs.

use std::sync::Arc;

use agentgate_ollama::GenerateRequest;
use agentgate_ollama::OllamaClient;

use crate::agent::TextGenerator;
use crate::cache::CacheName;
use crate::error::GatewayError;
use crate::gateway::CallPolicy;
use crate::gateway::Gateway;

pub struct ResilientGenerator {
    client: Arc<OllamaClient>,
    gateway: Arc<Gateway>,
}

impl ResilientGenerator {
    pub fn new(client: Arc<OllamaClient>, gateway: Arc<Gateway>) -> Self {
        Self { client, gateway }
    }

    fn cache_key(request: &GenerateRequest) -> String {
        format!(
            "{}|{}|{}|{}",
            request.model.as_deref().unwrap_or(""),
            request.system.as_deref().unwrap_or(""),
            request.context.as_deref().unwrap_or(""),
            request.prompt
        )
    }
}

impl TextGenerator for ResilientGenerator {
    async fn generate(&self, request: GenerateRequest) -> Result<String, GatewayError> {
        let policy =
            CallPolicy::llm("llm.generate").with_cache(CacheName::Ollama, Self::cache_key(&request));
        let client = Arc::clone(&self.client);
        self.gateway
            .execute(&policy, move || {
                let client = Arc::clone(&client);
                let request = request.clone();
                async move { client.generate(&request).await.map_err(GatewayError::from) }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    use super::*;
    use crate::gateway::GatewayOptions;

    #[tokio::test]
    async fn identical_requests_hit_the_ollama_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "cached answer", "done": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gateway = Gateway::new(GatewayOptions::default());
        let client = Arc::new(OllamaClient::new(server.uri(), "mistral"));
        let generator = ResilientGenerator::new(client, Arc::clone(&gateway));

        let request = GenerateRequest::new("what is cached?");
        let first = generator.generate(request.clone()).await.expect("first");
        let second = generator.generate(request).await.expect("second");
        assert_eq!(first, "cached answer");
        assert_eq!(first, second);

        let summary = gateway.metrics().summary();
        assert_eq!(summary.endpoints["llm.generate"].calls, 2);
        assert_eq!(summary.endpoints["llm.generate"].cache_hits, 1);
    }

    #[tokio::test]
    async fn different_prompts_miss_the_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "fresh", "done": true})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let gateway = Gateway::new(GatewayOptions::default());
        let client = Arc::new(OllamaClient::new(server.uri(), "mistral"));
        let generator = ResilientGenerator::new(client, gateway);

        generator
            .generate(GenerateRequest::new("one"))
            .await
            .expect("first");
        generator
            .generate(GenerateRequest::new("two"))
            .await
            .expect("second");
    }
}
