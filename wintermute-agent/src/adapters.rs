//! Concrete HTTP model adapters.
//!
//! Four flavors: a local chat server (`/api/chat`), an Anthropic-style cloud
//! endpoint, an OpenAI-style cloud endpoint, and a remote high-memory node
//! speaking the local-chat wire shape. All harvest token usage into
//! per-adapter counters and classify failures as transient or permanent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use wintermute_core::error::ModelApiError;

use crate::client::{ModelClient, ModelReply, StubModelClient, UsageCounters, UsageSnapshot};

const ENV_LOCAL_HOST: &str = "WINTERMUTE_LOCAL_HOST";
const ENV_LOCAL_MODEL: &str = "WINTERMUTE_LOCAL_MODEL";
const ENV_ANTHROPIC_KEY: &str = "ANTHROPIC_API_KEY";
const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";

const DEFAULT_LOCAL_HOST: &str = "http://localhost:11434";
const DEFAULT_LOCAL_MODEL: &str = "qwen2.5:7b";
const DEFAULT_CLOUD_MODEL: &str = "claude-sonnet-4-20250514";

fn classify_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn transport_error(model: &str, err: &reqwest::Error) -> ModelApiError {
    if err.is_timeout() {
        ModelApiError::transient(model, format!("timeout: {err}"))
    } else if err.is_connect() {
        ModelApiError::transient(model, format!("connection error: {err}"))
    } else {
        ModelApiError::permanent(model, err.to_string())
    }
}

async fn read_error_body(model: &str, response: reqwest::Response) -> ModelApiError {
    let status = response.status();
    let retryable = classify_status(status);
    let body = response.text().await.unwrap_or_default();
    let preview: String = body.chars().take(200).collect();
    ModelApiError {
        model: model.to_string(),
        message: format!("HTTP {status}: {preview}"),
        retryable,
    }
}

/// Adapter for a local chat-completion server (`POST /api/chat`).
pub struct LocalChatAdapter {
    name: String,
    model: String,
    host: String,
    num_ctx: u32,
    num_predict: u32,
    temperature: f64,
    http: reqwest::Client,
    usage: UsageCounters,
}

impl LocalChatAdapter {
    pub fn new(name: impl Into<String>, model: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            host: host.into(),
            num_ctx: 8192,
            num_predict: 1024,
            temperature: 0.2,
            http: reqwest::Client::new(),
            usage: UsageCounters::default(),
        }
    }

    /// Config precedence: explicit args > env vars > defaults.
    pub fn from_env(model: Option<&str>) -> Self {
        let host =
            std::env::var(ENV_LOCAL_HOST).unwrap_or_else(|_| DEFAULT_LOCAL_HOST.to_string());
        let model = model
            .map(str::to_string)
            .or_else(|| std::env::var(ENV_LOCAL_MODEL).ok())
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
        Self::new("local", model, host)
    }

    pub fn with_options(mut self, num_ctx: u32, num_predict: u32, temperature: f64) -> Self {
        self.num_ctx = num_ctx;
        self.num_predict = num_predict;
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelClient for LocalChatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ModelReply, ModelApiError> {
        let url = format!("{}/api/chat", self.host.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message},
            ],
            "options": {
                "num_ctx": self.num_ctx,
                "num_predict": self.num_predict,
                "temperature": self.temperature,
            },
            "format": "json",
            "stream": false,
        });

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(&self.model, &e))?;

        if !response.status().is_success() {
            return Err(read_error_body(&self.model, response).await);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ModelApiError::permanent(&self.model, format!("malformed response: {e}")))?;

        let text = data
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ModelApiError::permanent(&self.model, "response missing message.content")
            })?
            .to_string();

        let tokens_in = data
            .get("prompt_eval_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let tokens_out = data.get("eval_count").and_then(Value::as_u64).unwrap_or(0);
        self.usage.record(tokens_in, tokens_out);

        Ok(ModelReply {
            text,
            tokens_in,
            tokens_out,
        })
    }

    fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }
}

/// Anthropic-style messages endpoint with an optional minimum interval
/// between calls.
pub struct AnthropicAdapter {
    name: String,
    model: String,
    host: String,
    max_tokens: u32,
    api_key: String,
    /// When set, call starts are spaced at least this far apart.
    min_interval: Option<Duration>,
    last_call: tokio::sync::Mutex<Option<Instant>>,
    http: reqwest::Client,
    usage: UsageCounters,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            host: "https://api.anthropic.com".into(),
            max_tokens: 4096,
            api_key: std::env::var(ENV_ANTHROPIC_KEY).unwrap_or_default(),
            min_interval: None,
            last_call: tokio::sync::Mutex::new(None),
            http: reqwest::Client::new(),
            usage: UsageCounters::default(),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn pace(&self) {
        let Some(interval) = self.min_interval else {
            return;
        };
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ModelClient for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ModelReply, ModelApiError> {
        self.pace().await;

        let url = format!("{}/v1/messages", self.host.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_message}],
        });

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(&self.model, &e))?;

        if !response.status().is_success() {
            return Err(read_error_body(&self.model, response).await);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ModelApiError::permanent(&self.model, format!("malformed response: {e}")))?;

        let text = data
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelApiError::permanent(&self.model, "response missing content text"))?
            .to_string();

        let tokens_in = data
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let tokens_out = data
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.usage.record(tokens_in, tokens_out);

        Ok(ModelReply {
            text,
            tokens_in,
            tokens_out,
        })
    }

    fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }
}

/// OpenAI-style chat-completions endpoint.
pub struct OpenAiAdapter {
    name: String,
    model: String,
    host: String,
    max_tokens: u32,
    api_key: String,
    http: reqwest::Client,
    usage: UsageCounters,
}

impl OpenAiAdapter {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            host: "https://api.openai.com".into(),
            max_tokens: 4096,
            api_key: std::env::var(ENV_OPENAI_KEY).unwrap_or_default(),
            http: reqwest::Client::new(),
            usage: UsageCounters::default(),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ModelReply, ModelApiError> {
        let url = format!("{}/v1/chat/completions", self.host.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message},
            ],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(&self.model, &e))?;

        if !response.status().is_success() {
            return Err(read_error_body(&self.model, response).await);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ModelApiError::permanent(&self.model, format!("malformed response: {e}")))?;

        let text = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ModelApiError::permanent(&self.model, "response missing choices[0].message.content")
            })?
            .to_string();

        let tokens_in = data
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let tokens_out = data
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.usage.record(tokens_in, tokens_out);

        Ok(ModelReply {
            text,
            tokens_in,
            tokens_out,
        })
    }

    fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }
}

/// The high-memory remote node speaks the local-chat wire shape against a
/// different host.
pub struct RemoteNodeAdapter {
    inner: LocalChatAdapter,
}

impl RemoteNodeAdapter {
    pub fn new(name: impl Into<String>, model: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            inner: LocalChatAdapter::new(name, model, host),
        }
    }

    pub fn with_options(mut self, num_ctx: u32, num_predict: u32, temperature: f64) -> Self {
        self.inner = self.inner.with_options(num_ctx, num_predict, temperature);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.with_timeout(timeout);
        self
    }
}

#[async_trait]
impl ModelClient for RemoteNodeAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ModelReply, ModelApiError> {
        self.inner.call(system_prompt, user_message).await
    }

    fn usage(&self) -> UsageSnapshot {
        self.inner.usage()
    }
}

/// Parse a `--model-call` flag value into a client.
///
/// Supported modes: `stub`, `local`, `local:<model>`, `cloud`, `cloud:<model>`.
pub fn make_model_client(mode: &str) -> Result<Arc<dyn ModelClient>, ModelApiError> {
    match mode {
        "stub" => Ok(Arc::new(StubModelClient)),
        "local" => Ok(Arc::new(LocalChatAdapter::from_env(None))),
        "cloud" => Ok(Arc::new(AnthropicAdapter::new("cloud", DEFAULT_CLOUD_MODEL))),
        other => {
            // Split on the first colon only so model names with tags work,
            // e.g. "local:deepseek-r1:1.5b".
            if let Some(model) = other.strip_prefix("local:") {
                Ok(Arc::new(LocalChatAdapter::from_env(Some(model))))
            } else if let Some(model) = other.strip_prefix("cloud:") {
                Ok(Arc::new(AnthropicAdapter::new("cloud", model)))
            } else {
                Err(ModelApiError::permanent(
                    "config",
                    format!(
                        "unknown model-call mode '{other}'; supported: stub, local, local:<model>, cloud, cloud:<model>"
                    ),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(reqwest::StatusCode::from_u16(429).unwrap()));
        assert!(classify_status(reqwest::StatusCode::from_u16(503).unwrap()));
        assert!(classify_status(reqwest::StatusCode::from_u16(408).unwrap()));
        assert!(!classify_status(reqwest::StatusCode::from_u16(400).unwrap()));
        assert!(!classify_status(reqwest::StatusCode::from_u16(404).unwrap()));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(make_model_client("stub").unwrap().name(), "stub");
        assert_eq!(make_model_client("local").unwrap().name(), "local");
        assert_eq!(make_model_client("cloud").unwrap().name(), "cloud");
        assert!(make_model_client("ollama").is_err());
    }

    #[test]
    fn model_tag_survives_colon_split() {
        let client = make_model_client("local:deepseek-r1:1.5b").unwrap();
        assert_eq!(client.name(), "local");
    }

    #[tokio::test]
    async fn min_interval_spaces_call_starts() {
        let adapter = AnthropicAdapter::new("cloud_a", "test-model")
            .with_min_interval(Duration::from_millis(50));

        let t0 = Instant::now();
        adapter.pace().await;
        adapter.pace().await;
        adapter.pace().await;
        // First pace is free, the next two wait 50ms each.
        assert!(t0.elapsed() >= Duration::from_millis(100));
    }
}
