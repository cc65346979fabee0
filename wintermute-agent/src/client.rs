//! The `ModelClient` abstraction the runtime and dispatcher work against.
//! Decouples the agent lifecycle from any specific model endpoint.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use wintermute_core::error::ModelApiError;

/// A completion from a model endpoint, with harvested token usage.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl ModelReply {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

/// Cumulative per-adapter counters, updated under a mutex so totals stay
/// consistent across concurrent runs.
#[derive(Debug, Default)]
pub struct UsageCounters {
    inner: Mutex<UsageSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct UsageSnapshot {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl UsageCounters {
    pub fn record(&self, tokens_in: u64, tokens_out: u64) {
        let mut inner = self.inner.lock().expect("usage counter lock");
        inner.calls += 1;
        inner.tokens_in += tokens_in;
        inner.tokens_out += tokens_out;
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        *self.inner.lock().expect("usage counter lock")
    }
}

/// Uniform completion surface over model endpoints.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, system_prompt: &str, user_message: &str)
        -> Result<ModelReply, ModelApiError>;

    fn usage(&self) -> UsageSnapshot {
        UsageSnapshot::default()
    }
}

type ScriptedReply = Result<String, ModelApiError>;

/// Scripted client for tests: replays canned replies in order and records
/// every prompt it receives.
pub struct MockModelClient {
    name: String,
    replies: Mutex<Vec<ScriptedReply>>,
    calls: Mutex<Vec<(String, String)>>,
    usage: UsageCounters,
}

impl MockModelClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            name: "mock".into(),
            replies: Mutex::new(replies),
            calls: Mutex::new(Vec::new()),
            usage: UsageCounters::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replies as plain texts, the common case.
    pub fn from_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock call log lock").len()
    }

    pub fn recorded_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("mock call log lock").clone()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ModelReply, ModelApiError> {
        self.calls
            .lock()
            .expect("mock call log lock")
            .push((system_prompt.to_string(), user_message.to_string()));

        let mut replies = self.replies.lock().expect("mock replies lock");
        if replies.is_empty() {
            return Err(ModelApiError::permanent(&self.name, "mock replies exhausted"));
        }
        let reply = replies.remove(0)?;
        let tokens_in = (system_prompt.len() + user_message.len()) as u64 / 4;
        let tokens_out = reply.len() as u64 / 4;
        self.usage.record(tokens_in, tokens_out);
        Ok(ModelReply {
            text: reply,
            tokens_in,
            tokens_out,
        })
    }

    fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }
}

/// Placeholder client for dry runs: every call fails permanently.
pub struct StubModelClient;

#[async_trait]
impl ModelClient for StubModelClient {
    fn name(&self) -> &str {
        "stub"
    }

    async fn call(
        &self,
        _system_prompt: &str,
        _user_message: &str,
    ) -> Result<ModelReply, ModelApiError> {
        Err(ModelApiError::permanent(
            "stub",
            "no model adapter configured; pass --model-call local or cloud",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_replays_in_order_and_counts_usage() {
        let client = MockModelClient::from_texts(&[r#"{"a": 1}"#, r#"{"b": 2}"#]);

        let first = client.call("sys", "user").await.unwrap();
        assert_eq!(first.text, r#"{"a": 1}"#);
        let second = client.call("sys", "user").await.unwrap();
        assert_eq!(second.text, r#"{"b": 2}"#);

        assert_eq!(client.call_count(), 2);
        assert_eq!(client.usage().calls, 2);
        assert!(client.usage().tokens_in > 0);
    }

    #[tokio::test]
    async fn mock_exhaustion_is_permanent() {
        let client = MockModelClient::from_texts(&[]);
        let err = client.call("sys", "user").await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn stub_always_fails() {
        let err = StubModelClient.call("s", "u").await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.to_string().contains("no model adapter"));
    }
}
