use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::{CampaignError, Result};

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited")]
    RateLimited,
    #[error("http error: {0}")]
    Http(String),
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Fatal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self { role: role.to_string(), content: content.to_string() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// JSON schema the response must follow, if any.
    pub response_schema: Option<serde_json::Value>,
    pub model_args: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> std::result::Result<String, ProviderError>;
    fn name(&self) -> &'static str;
}

/// Model service named by the `type` field of a campaign config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenAi,
    Ollama,
    Vllm,
    Anthropic,
    Mock,
}

impl Backend {
    /// Accepts `openai`, `openai_metric`, `openai_gen` and so on.
    pub fn parse(model_type: &str) -> Result<Self> {
        let base = model_type
            .strip_suffix("_metric")
            .or_else(|| model_type.strip_suffix("_gen"))
            .unwrap_or(model_type);
        match base {
            "openai" => Ok(Backend::OpenAi),
            "ollama" => Ok(Backend::Ollama),
            "vllm" => Ok(Backend::Vllm),
            "anthropic" => Ok(Backend::Anthropic),
            "mock" => Ok(Backend::Mock),
            other => Err(CampaignError::InvalidConfig(format!(
                "Model type {other} is not implemented."
            ))),
        }
    }
}

/// Resolves a backend to a client, checking credentials up front.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, backend: Backend, api_url: Option<&str>) -> Result<Arc<dyn ModelClient>>;
}

pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| CampaignError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { http })
    }
}

fn env_key(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| {
        CampaignError::MissingCredentials(format!(
            "Required API variable {var} not found. Add it to the environment or the .env file."
        ))
    })
}

fn validate_ollama_url(api_url: Option<&str>) -> Result<String> {
    let url = api_url
        .ok_or_else(|| CampaignError::InvalidConfig("ollama requires `api_url`".into()))?
        .trim_end_matches('/');
    if url.ends_with("/generate") || url.ends_with("/chat") || url.ends_with("/api") {
        return Err(CampaignError::InvalidConfig(format!(
            "The API URL {url} is not valid. Use only the base URL, e.g. http://localhost:11434."
        )));
    }
    Ok(url.to_string())
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, backend: Backend, api_url: Option<&str>) -> Result<Arc<dyn ModelClient>> {
        let client: Arc<dyn ModelClient> = match backend {
            Backend::OpenAi => Arc::new(OpenAiCompatClient {
                http: self.http.clone(),
                endpoint: "https://api.openai.com/v1/chat/completions".into(),
                api_key: Some(env_key("OPENAI_API_KEY")?),
                name: "openai",
            }),
            Backend::Ollama => Arc::new(OpenAiCompatClient {
                http: self.http.clone(),
                endpoint: format!("{}/v1/chat/completions", validate_ollama_url(api_url)?),
                api_key: None,
                name: "ollama",
            }),
            Backend::Vllm => {
                let url = api_url.ok_or_else(|| {
                    CampaignError::InvalidConfig("vllm requires `api_url`".into())
                })?;
                Arc::new(OpenAiCompatClient {
                    http: self.http.clone(),
                    endpoint: format!("{}/chat/completions", url.trim_end_matches('/')),
                    api_key: std::env::var("VLLM_API_KEY").ok(),
                    name: "vllm",
                })
            }
            Backend::Anthropic => Arc::new(AnthropicClient {
                http: self.http.clone(),
                api_key: env_key("ANTHROPIC_API_KEY")?,
            }),
            Backend::Mock => Arc::new(MockClient::echo()),
        };
        Ok(client)
    }
}

/// Hands out one fixed client for every backend. Used to inject scripted models.
pub struct StaticClientFactory(pub Arc<dyn ModelClient>);

impl ClientFactory for StaticClientFactory {
    fn client_for(
        &self,
        _backend: Backend,
        _api_url: Option<&str>,
    ) -> Result<Arc<dyn ModelClient>> {
        Ok(self.0.clone())
    }
}

fn classify(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        429 => ProviderError::RateLimited,
        401 | 403 => ProviderError::Fatal(format!("{status}: {body}")),
        _ => ProviderError::Http(format!("{status}: {body}")),
    }
}

/// OpenAI chat-completions API and the servers that mimic it (Ollama, vLLM).
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    name: &'static str,
}

#[derive(Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}
#[derive(Deserialize)]
struct Choice {
    message: MsgOwned,
}
#[derive(Deserialize)]
struct MsgOwned {
    content: Option<String>,
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError> {
        let mut body = req.model_args.clone();
        body.insert("model".into(), req.model.clone().into());
        body.insert(
            "messages".into(),
            serde_json::to_value(&req.messages).map_err(|e| ProviderError::Fatal(e.to_string()))?,
        );
        if let Some(schema) = &req.response_schema {
            body.insert(
                "response_format".into(),
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {"name": "OutputAnnotations", "schema": schema},
                }),
            );
        }

        let mut rb = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await.map_err(|e| ProviderError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify(status, &text));
        }
        let parsed: ChatResp = resp.json().await.map_err(|e| ProviderError::Http(e.to_string()))?;
        debug!(client = self.name, model = %req.model, "completion received");
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Http("empty completion".into()))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
}

#[derive(Deserialize)]
struct AnthropicResp {
    content: Vec<AnthropicBlock>,
}
#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError> {
        let mut system: Vec<String> = req
            .messages
            .iter()
            .filter(|m| m.role == "system" && !m.content.is_empty())
            .map(|m| m.content.clone())
            .collect();
        if let Some(schema) = &req.response_schema {
            system.push(format!(
                "Respond only with a JSON object that follows this JSON schema: {schema}"
            ));
        }
        let messages: Vec<&ChatMessage> =
            req.messages.iter().filter(|m| m.role != "system").collect();

        let mut body = req.model_args.clone();
        body.entry("max_tokens").or_insert_with(|| 1024.into());
        body.insert("model".into(), req.model.clone().into());
        body.insert("system".into(), system.join("\n\n").into());
        body.insert(
            "messages".into(),
            serde_json::to_value(&messages).map_err(|e| ProviderError::Fatal(e.to_string()))?,
        );

        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify(status, &text));
        }
        let parsed: AnthropicResp =
            resp.json().await.map_err(|e| ProviderError::Http(e.to_string()))?;
        Ok(parsed.content.into_iter().filter_map(|b| b.text).collect::<Vec<_>>().join(""))
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

type CallHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Offline model. Replays a script of responses, or echoes the prompt when the script runs out.
pub struct MockClient {
    script: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
    calls: Mutex<Vec<CompletionRequest>>,
    on_call: Option<CallHook>,
}

impl MockClient {
    pub fn echo() -> Self {
        Self { script: Mutex::new(VecDeque::new()), calls: Mutex::new(Vec::new()), on_call: None }
    }

    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(responses.into_iter().map(|s| Ok(s.into())))
    }

    pub fn with_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<String, ProviderError>>,
    {
        Self { script: Mutex::new(results.into_iter().collect()), ..Self::echo() }
    }

    /// Run `hook(call_number)` (1-based) after each call.
    pub fn on_call(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Arc::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(req.clone());
            calls.len()
        };
        let next = self.script.lock().pop_front();
        let result = next.unwrap_or_else(|| {
            if req.response_schema.is_some() {
                Ok(r#"{"annotations": []}"#.to_string())
            } else {
                let prompt = req
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.as_str());
                Ok(format!("mock output for: {}", prompt.unwrap_or_default()))
            }
        });
        if let Some(hook) = &self.on_call {
            hook(n);
        }
        result
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
