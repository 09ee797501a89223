//! LiteLLM/OpenAI-compatible backend for memo-forge.
//!
//! This module defines the message type exchanged with backends, the
//! [`LlmBackend`] capability the retrying caller depends on, and an HTTP
//! client for any chat-completions compatible endpoint.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::BackendSettings;
use crate::error::LlmError;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 240;

/// Fragments of an error body that mark a failure as worth retrying.
const TRANSIENT_MARKERS: &[&str] = &["limit", "resource", "timeout", "time out", "try again"];

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender (e.g., "system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Outcome of a single backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendReply {
    /// The backend produced a text response.
    Text(String),
    /// Network error, timeout, rate limit or similar. Worth retrying.
    Transient(String),
    /// The backend refused the content. Retried a bounded number of times,
    /// never cached.
    Blocked(String),
}

impl BackendReply {
    /// Short label used in logs and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendReply::Text(_) => "text",
            BackendReply::Transient(_) => "transient",
            BackendReply::Blocked(_) => "blocked",
        }
    }

    /// Text payload or failure reason.
    pub fn detail(&self) -> &str {
        match self {
            BackendReply::Text(s) | BackendReply::Transient(s) | BackendReply::Blocked(s) => s,
        }
    }
}

/// Capability of a remote text-generation service.
///
/// Implementations own their request timeouts and never panic on remote
/// failures; they report them as [`BackendReply::Transient`] or
/// [`BackendReply::Blocked`] instead.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Run `messages` through the backend selected for `operation`.
    async fn invoke(&self, operation: &str, messages: &[Message]) -> BackendReply;
}

/// Client for LiteLLM/OpenAI-compatible chat-completions APIs.
pub struct LiteLlmClient {
    /// Base URL for the API.
    api_base: String,
    /// Optional API key for authentication.
    api_key: Option<String>,
    /// Model sent with every request.
    model: String,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl LiteLlmClient {
    /// Create a new client with explicit configuration.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL (e.g., "http://localhost:4000/v1")
    /// * `api_key` - Optional bearer token
    /// * `model` - Model identifier sent in every request
    /// * `timeout` - Per-request timeout
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::ClientBuild(e.to_string()))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http_client,
        })
    }

    /// Create a client from a configured backend entry.
    ///
    /// The API key is taken from `api_key`, or else from the environment
    /// variable named by `api_key_env`.
    pub fn from_settings(name: &str, settings: &BackendSettings) -> Result<Self, LlmError> {
        let api_key = settings.resolve_api_key();
        if api_key.is_none() && settings.api_key_env.is_some() {
            return Err(LlmError::MissingApiKey(name.to_string()));
        }

        Self::new(
            settings.api_base.clone(),
            api_key,
            settings.model.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Get the configured model.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check if an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send(&self, messages: &[Message]) -> Result<ApiResponse, BackendReply> {
        let api_request = ApiRequest {
            model: &self.model,
            messages,
        };

        let url = format!("{}/chat/completions", self.api_base);
        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&api_request)
            .send()
            .await
            .map_err(|e| BackendReply::Transient(format!("request failed: {e}")))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);
            return Err(classify_failure(Some(status), &message));
        }

        http_response
            .json::<ApiResponse>()
            .await
            .map_err(|e| BackendReply::Transient(format!("unreadable response: {e}")))
    }
}

#[async_trait]
impl LlmBackend for LiteLlmClient {
    async fn invoke(&self, operation: &str, messages: &[Message]) -> BackendReply {
        let response = match self.send(messages).await {
            Ok(response) => response,
            Err(reply) => {
                tracing::warn!(
                    operation = operation,
                    model = %self.model,
                    outcome = reply.kind(),
                    reason = %truncate(reply.detail(), 300),
                    "Backend call failed"
                );
                return reply;
            }
        };

        let choice = response.choices.into_iter().next();
        if let Some(reason) = choice.as_ref().and_then(|c| c.finish_reason.as_deref()) {
            if reason == "content_filter" {
                return BackendReply::Blocked("finish_reason=content_filter".to_string());
            }
        }

        match choice.and_then(|c| c.message.content) {
            Some(content) if !content.trim().is_empty() => BackendReply::Text(content),
            _ => BackendReply::Transient("empty completion".to_string()),
        }
    }
}

/// Decide whether a failed call is worth retrying or a content rejection.
///
/// Request timeouts, rate limits and server errors are transient. For any
/// other failure the body is scanned for wording that hints at quota,
/// overload or timeouts; everything else is treated as the backend refusing
/// the content.
pub fn classify_failure(status: Option<StatusCode>, body: &str) -> BackendReply {
    if let Some(status) = status {
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            return BackendReply::Transient(format!("HTTP {}: {}", status.as_u16(), body));
        }
    }

    let lowered = body.to_lowercase();
    let detail = match status {
        Some(status) => format!("HTTP {}: {}", status.as_u16(), body),
        None => body.to_string(),
    };

    if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        BackendReply::Transient(detail)
    } else {
        BackendReply::Blocked(detail)
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Internal request structure for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

/// Internal response structure from the OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("a").role, "system");
        assert_eq!(Message::user("b").role, "user");
        assert_eq!(Message::assistant("c").role, "assistant");
        assert_eq!(Message::user("b").content, "b");
    }

    #[test]
    fn test_classify_rate_limit_is_transient() {
        let reply = classify_failure(Some(StatusCode::TOO_MANY_REQUESTS), "slow down");
        assert!(matches!(reply, BackendReply::Transient(_)));
    }

    #[test]
    fn test_classify_server_error_is_transient() {
        let reply = classify_failure(Some(StatusCode::BAD_GATEWAY), "upstream");
        assert!(matches!(reply, BackendReply::Transient(_)));
    }

    #[test]
    fn test_classify_quota_wording_is_transient() {
        for body in [
            "Resource has been exhausted",
            "Request Timeout",
            "rate LIMIT reached",
            "please try again later",
        ] {
            let reply = classify_failure(Some(StatusCode::BAD_REQUEST), body);
            assert!(
                matches!(reply, BackendReply::Transient(_)),
                "expected transient for {body:?}"
            );
        }
    }

    #[test]
    fn test_classify_policy_rejection_is_blocked() {
        let reply = classify_failure(
            Some(StatusCode::BAD_REQUEST),
            "The prompt was blocked due to PROHIBITED_CONTENT",
        );
        assert!(matches!(reply, BackendReply::Blocked(_)));
        assert!(reply.detail().contains("400"));
    }

    #[test]
    fn test_reply_kind_labels() {
        assert_eq!(BackendReply::Text("x".into()).kind(), "text");
        assert_eq!(BackendReply::Transient("x".into()).kind(), "transient");
        assert_eq!(BackendReply::Blocked("x".into()).kind(), "blocked");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = LiteLlmClient::new(
            "http://localhost:4000/v1/",
            None,
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.api_base(), "http://localhost:4000/v1");
        assert_eq!(client.model(), "gpt-4o-mini");
        assert!(!client.has_api_key());
    }
}
