//! Memoized, bounded-retry calls to an LLM backend.
//!
//! [`RetryingCaller::call`] derives a [`CallKey`] from the operation and the
//! messages, answers from the [`PersistentCache`] when it can, and otherwise
//! invokes the backend up to `max_retries + 1` times. Each text reply runs
//! through the post-processors; the first reply that survives all of them is
//! cached and returned. Transient failures, content rejections and
//! post-processing rejections are all retried and, once attempts run out,
//! collapse to `None`. Call failures never surface as errors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::cache::{is_usable, CallKey, PersistentCache};
use super::litellm::{truncate, BackendReply, LlmBackend, Message};
use super::postprocess::{apply_all, PostProcessor};
use crate::config::RetrySettings;
use crate::storage::AppendLog;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Fixed delay before each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Builder method to set the delay between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }
}

/// One line of the audit log: a single backend invocation.
#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub timestamp: DateTime<Utc>,
    /// Shared by every attempt of one logical call.
    pub request_id: Uuid,
    pub operation: &'a str,
    pub key_digest: &'a str,
    pub attempt: u32,
    /// `text`, `transient` or `blocked`.
    pub outcome: &'static str,
    /// Reply text or failure reason.
    pub response: &'a str,
}

/// Wraps a backend with the response cache and a bounded retry loop.
///
/// Cheap to share: clone the `Arc`s, or wrap the caller itself in an `Arc`.
pub struct RetryingCaller {
    backend: Arc<dyn LlmBackend>,
    cache: Arc<PersistentCache>,
    audit: Option<Arc<AppendLog>>,
    policy: RetryPolicy,
}

impl RetryingCaller {
    pub fn new(backend: Arc<dyn LlmBackend>, cache: Arc<PersistentCache>) -> Self {
        Self {
            backend,
            cache,
            audit: None,
            policy: RetryPolicy::default(),
        }
    }

    /// Builder method to record every backend invocation to `log`.
    pub fn with_audit_log(mut self, log: Arc<AppendLog>) -> Self {
        self.audit = Some(log);
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn cache(&self) -> &Arc<PersistentCache> {
        &self.cache
    }

    /// Call `operation` with the configured retry policy.
    pub async fn call(
        &self,
        operation: &str,
        messages: &[Message],
        processors: &[Arc<dyn PostProcessor>],
    ) -> Option<Value> {
        self.call_with_retries(operation, messages, processors, self.policy.max_retries)
            .await
    }

    /// Call `operation`, overriding the number of retries for this call only.
    ///
    /// Returns the cached or freshly validated value, or `None` once every
    /// attempt has failed.
    pub async fn call_with_retries(
        &self,
        operation: &str,
        messages: &[Message],
        processors: &[Arc<dyn PostProcessor>],
        max_retries: u32,
    ) -> Option<Value> {
        let key = match CallKey::new(operation, messages) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(operation = operation, error = %e, "Failed to derive call key");
                return None;
            }
        };

        if let Some(value) = self.cache.get(&key) {
            tracing::debug!(operation = operation, key = %key.digest(), "Cache hit");
            return Some(value);
        }

        let request_id = Uuid::new_v4();
        let digest = key.digest();

        for attempt in 0..=max_retries {
            if attempt > 0 && !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff).await;
            }

            let reply = self.backend.invoke(operation, messages).await;
            self.record(&AuditRecord {
                timestamp: Utc::now(),
                request_id,
                operation,
                key_digest: &digest,
                attempt,
                outcome: reply.kind(),
                response: reply.detail(),
            });

            match reply {
                BackendReply::Text(text) => {
                    match apply_all(processors, Value::String(text)) {
                        Ok(value) if is_usable(&value) => {
                            self.store(key, &value).await;
                            return Some(value);
                        }
                        Ok(_) => {
                            tracing::warn!(
                                operation = operation,
                                attempt = attempt + 1,
                                "Reply was empty after post-processing, retrying"
                            );
                        }
                        Err(processor) => {
                            tracing::warn!(
                                operation = operation,
                                attempt = attempt + 1,
                                processor = %processor,
                                "Reply rejected by post-processor, retrying"
                            );
                        }
                    }
                }
                BackendReply::Transient(reason) => {
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        reason = %truncate(&reason, 200),
                        "Transient backend failure, will retry"
                    );
                }
                BackendReply::Blocked(reason) => {
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        reason = %truncate(&reason, 200),
                        "Backend rejected the content"
                    );
                }
            }
        }

        tracing::warn!(
            operation = operation,
            key = %digest,
            attempts = max_retries + 1,
            "Giving up after exhausting retries"
        );
        None
    }

    async fn store(&self, key: CallKey, value: &Value) {
        if let Err(e) = self.cache.put_async(key, value.clone()).await {
            tracing::error!(error = %e, "Failed to persist cache entry");
        }
    }

    fn record(&self, record: &AuditRecord<'_>) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.write(record) {
                tracing::warn!(error = %e, "Failed to write audit record");
            }
        }
    }
}
