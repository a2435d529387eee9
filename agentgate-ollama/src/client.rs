use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::prompt::build_prompt;

/// How long a fetched model list stays fresh before `/api/tags` is queried
/// again.
const MODEL_LIST_TTL: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Failure kinds at the inference boundary. Connection problems, timeouts
/// and 5xx responses are retryable; 4xx responses and shape mismatches are
/// not.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("inference service unreachable: {0}")]
    Unreachable(String),
    #[error("request to inference service timed out")]
    Timeout,
    #[error("inference service returned HTTP {0}")]
    ServerStatus(u16),
    #[error("inference service rejected the request: HTTP {0}")]
    ClientStatus(u16),
    #[error("model '{0}' is not available")]
    UnknownModel(String),
    #[error("model name '{name}' is ambiguous: {candidates:?}")]
    AmbiguousModel { name: String, candidates: Vec<String> },
    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Unreachable(_) => "llm-unreachable",
            LlmError::Timeout => "timeout",
            LlmError::ServerStatus(_) => "llm-server",
            LlmError::ClientStatus(_) => "llm-client",
            LlmError::UnknownModel(_) | LlmError::AmbiguousModel { .. } => "llm-model",
            LlmError::InvalidResponse(_) => "llm-invalid",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Unreachable(_) | LlmError::Timeout | LlmError::ServerStatus(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub num_ctx: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            num_ctx: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub context: Option<String>,
    pub model: Option<String>,
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            context: None,
            model: None,
            options: GenerateOptions::default(),
        }
    }
}

/// Client for the local Ollama HTTP API.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    default_model: RwLock<String>,
    model_cache: Mutex<Option<(Instant, Vec<ModelInfo>)>>,
    request_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: RwLock::new(default_model.into()),
            model_cache: Mutex::new(None),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe whether the server is reachable via its model index.
    pub async fn probe(&self) -> Result<(), LlmError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(map_request_error)?;
        check_status(&response)?;
        Ok(())
    }

    /// List available models; results are cached for [`MODEL_LIST_TTL`].
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        {
            let cache = self.model_cache.lock().await;
            if let Some((fetched_at, models)) = cache.as_ref() {
                if fetched_at.elapsed() < MODEL_LIST_TTL {
                    return Ok(models.clone());
                }
            }
        }
        self.refresh_models().await
    }

    /// Fetch the model list from the server, bypassing the cache.
    pub async fn refresh_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(map_request_error)?;
        check_status(&response)?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let models: Vec<ModelInfo> = body
            .get("models")
            .and_then(|models| models.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        debug!("discovered {} models", models.len());
        *self.model_cache.lock().await = Some((Instant::now(), models.clone()));
        Ok(models)
    }

    pub async fn current_model(&self) -> String {
        self.default_model.read().await.clone()
    }

    /// Switch the process-wide default model. Exact names win; otherwise a
    /// unique prefix resolves (e.g. `"llama3"` selects `"llama3:latest"`).
    pub async fn switch_model(&self, name: &str) -> Result<String, LlmError> {
        let models = self.list_models().await?;
        let names: Vec<&str> = models.iter().map(|model| model.name.as_str()).collect();

        let resolved = if names.contains(&name) {
            name.to_string()
        } else {
            let matches: Vec<&str> = names
                .iter()
                .copied()
                .filter(|candidate| candidate.starts_with(name))
                .collect();
            match matches.as_slice() {
                [only] => (*only).to_string(),
                [] => return Err(LlmError::UnknownModel(name.to_string())),
                _ => {
                    return Err(LlmError::AmbiguousModel {
                        name: name.to_string(),
                        candidates: matches.iter().map(|m| (*m).to_string()).collect(),
                    });
                }
            }
        };

        let mut current = self.default_model.write().await;
        if *current != resolved {
            info!("switching default model from '{current}' to '{resolved}'");
            *current = resolved.clone();
        }
        Ok(resolved)
    }

    /// Run one non-streaming generation and return the full response text.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        let model = match &request.model {
            Some(model) => model.clone(),
            None => self.current_model().await,
        };
        let prompt = build_prompt(
            &request.prompt,
            request.system.as_deref(),
            request.context.as_deref(),
        );

        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": request.options,
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;
        check_status(&response)?;

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        match payload.get("response").and_then(|text| text.as_str()) {
            Some(text) => Ok(text.to_string()),
            None => {
                warn!("generate reply carried no 'response' field");
                Err(LlmError::InvalidResponse(
                    "missing 'response' field".to_string(),
                ))
            }
        }
    }
}

fn map_request_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Unreachable(err.to_string())
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), LlmError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(LlmError::ServerStatus(status.as_u16()))
    } else {
        Err(LlmError::ClientStatus(status.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    use super::*;

    async fn tags_server(models: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "models": models })),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn list_models_parses_tags() {
        let server = tags_server(json!([
            {"name": "llama3.2:3b", "size": 123},
            {"name": "mistral"}
        ]))
        .await;
        let client = OllamaClient::new(server.uri(), "llama3.2:3b");
        let models = client.list_models().await.expect("list models");
        let names: Vec<&str> = models.iter().map(|model| model.name.as_str()).collect();
        assert_eq!(names, vec!["llama3.2:3b", "mistral"]);
    }

    #[tokio::test]
    async fn model_list_is_cached_between_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"models": [{"name": "mistral"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "mistral");
        client.list_models().await.expect("first fetch");
        client.list_models().await.expect("second fetch hits cache");
    }

    #[tokio::test]
    async fn switch_model_resolves_unique_prefix() {
        let server = tags_server(json!([
            {"name": "llama3.2:3b"},
            {"name": "mistral:latest"}
        ]))
        .await;
        let client = OllamaClient::new(server.uri(), "llama3.2:3b");
        let resolved = client.switch_model("mistral").await.expect("switch");
        assert_eq!(resolved, "mistral:latest");
        assert_eq!(client.current_model().await, "mistral:latest");
    }

    #[tokio::test]
    async fn switch_model_rejects_ambiguous_prefix() {
        let server = tags_server(json!([
            {"name": "llama3.2:3b"},
            {"name": "llama3.2:1b"}
        ]))
        .await;
        let client = OllamaClient::new(server.uri(), "llama3.2:3b");
        let err = client.switch_model("llama3").await.expect_err("ambiguous");
        match err {
            LlmError::AmbiguousModel { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected AmbiguousModel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn switch_model_rejects_unknown_name() {
        let server = tags_server(json!([{"name": "mistral"}])).await;
        let client = OllamaClient::new(server.uri(), "mistral");
        let err = client.switch_model("gemma").await.expect_err("unknown");
        assert!(matches!(err, LlmError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn generate_submits_composite_prompt_without_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"stream": false, "model": "mistral"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "All good.", "done": true})),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "mistral");
        let mut request = GenerateRequest::new("How are you?");
        request.context = Some("The user is fine.".to_string());
        let text = client.generate(&request).await.expect("generate");
        assert_eq!(text, "All good.");
    }

    #[tokio::test]
    async fn server_errors_are_retryable_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "mistral");
        let err = client
            .generate(&GenerateRequest::new("hi"))
            .await
            .expect_err("500 must fail");
        assert!(matches!(err, LlmError::ServerStatus(500)));
        assert!(err.is_retryable());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = OllamaClient::new(server.uri(), "mistral");
        let err = client
            .generate(&GenerateRequest::new("hi"))
            .await
            .expect_err("404 must fail");
        assert!(matches!(err, LlmError::ClientStatus(404)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_unreachable_kind() {
        // Nothing listens on port 1.
        let client = OllamaClient::new("http://127.0.0.1:1", "mistral");
        let err = client.probe().await.expect_err("probe must fail");
        assert_eq!(err.kind(), "llm-unreachable");
    }

    #[tokio::test]
    async fn malformed_generate_reply_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .mount(&server)
            .await;
        let client = OllamaClient::new(server.uri(), "mistral");
        let err = client
            .generate(&GenerateRequest::new("hi"))
            .await
            .expect_err("missing response field");
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
