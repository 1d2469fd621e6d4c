//! OpenAI-compatible chat completion provider over HTTP.
//!
//! Failures keep the HTTP status and response body in their message so the
//! substring classifiers in [`crate::error_code`] can sort them.

use crate::provider::ProviderPort;
use crate::types::Request;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::Proxy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Settings for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    /// Falls back to `AI_BATCH_API_KEY` when unset.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_secs: 120,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Registry key identifying an endpoint + model pair.
    pub fn registry_key(&self) -> String {
        format!("{}#{}", self.base_url.trim_end_matches('/'), self.model)
    }
}

/// `POST {base_url}/chat/completions` binding.
///
/// Non-2xx responses become [`Error::Provider`] carrying the status line and
/// body, which is what the retry and classification logic match against.
pub struct HttpChatProvider {
    name: String,
    client: reqwest::Client,
    endpoint: Url,
    config: HttpProviderConfig,
    api_key: Option<String>,
    cancel: Mutex<CancellationToken>,
    closed: AtomicBool,
}

impl HttpChatProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| {
                Error::configuration_with_context(
                    "invalid provider base URL",
                    ErrorContext::new()
                        .with_field_path("base_url")
                        .with_details(format!("{}: {}", config.base_url, e))
                        .with_source("http_provider"),
                )
            })?;

        let api_key = config
            .api_key
            .clone()
            .or_else(|| env::var("AI_BATCH_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .pool_max_idle_per_host(
                env::var("AI_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            );

        if let Ok(proxy_url) = env::var("AI_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder.build()?;

        Ok(Self {
            name: format!("http:{}", config.model),
            client,
            endpoint,
            config,
            api_key,
            cancel: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_body(&self, request: &Request) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_instruction {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.content}));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(t) = self.config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = self.config.max_tokens {
            body["max_tokens"] = json!(n);
        }
        body
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn execute(&self, request: &Request) -> Result<String> {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .json(&self.request_body(request))
            .header("x-request-id", request.id.as_str());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(
                request_id = request.id.as_str(),
                http_status = status.as_u16(),
                "completion request failed"
            );
            return Err(Error::provider(format!("HTTP {}: {}", status, body.trim())));
        }

        let json: Value = resp.json().await?;
        extract_content(&json)
    }
}

/// Pull `choices[0].message.content` out of a chat completion body.
///
/// A null or absent `content` on an otherwise well-formed choice is an empty
/// success.
pub(crate) fn extract_content(json: &Value) -> Result<String> {
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(Error::provider(message));
    }

    let message = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| Error::provider("malformed completion response: missing choices[0].message"))?;

    Ok(message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

#[async_trait]
impl ProviderPort for HttpChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &Request) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::runtime_with_context(
                "provider is closed",
                ErrorContext::new().with_source(self.name.clone()),
            ));
        }
        let token = self.current_token();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            out = self.execute(request) => out,
        }
    }

    /// Abort every in-flight send; later sends proceed normally.
    fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel();
    }
}
