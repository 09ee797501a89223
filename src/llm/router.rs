//! Operation-based backend routing.
//!
//! The retrying caller only knows an operation id such as `"gpt-4o"` or
//! `"gemini"`. The router maps that id to a concrete backend: an exact name
//! match wins, otherwise the longest registered prefix is used, so `"claude"`
//! serves `"claude-sonnet"` and `"claude-opus"` alike.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::litellm::{BackendReply, LiteLlmClient, LlmBackend, Message};
use crate::config::ForgeConfig;
use crate::error::LlmError;

/// Routes operations to registered backends.
#[derive(Default, Clone)]
pub struct BackendRouter {
    exact: HashMap<String, Arc<dyn LlmBackend>>,
    prefixes: Vec<(String, Arc<dyn LlmBackend>)>,
}

impl BackendRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router with one HTTP client per configured backend.
    ///
    /// Each backend is registered under its name, and additionally under its
    /// `prefix` when one is configured.
    pub fn from_config(config: &ForgeConfig) -> Result<Self, LlmError> {
        let mut router = Self::new();
        for (name, settings) in &config.backends {
            let client: Arc<dyn LlmBackend> = Arc::new(LiteLlmClient::from_settings(name, settings)?);
            router.register(name.clone(), Arc::clone(&client));
            if let Some(prefix) = &settings.prefix {
                router.register_prefix(prefix.clone(), client);
            }
            tracing::debug!(backend = %name, model = %settings.model, "Backend registered");
        }
        Ok(router)
    }

    /// Register a backend for one exact operation id.
    pub fn register(&mut self, operation: impl Into<String>, backend: Arc<dyn LlmBackend>) {
        self.exact.insert(operation.into(), backend);
    }

    /// Register a backend for every operation id starting with `prefix`.
    pub fn register_prefix(&mut self, prefix: impl Into<String>, backend: Arc<dyn LlmBackend>) {
        let prefix = prefix.into();
        self.prefixes.retain(|(p, _)| *p != prefix);
        self.prefixes.push((prefix, backend));
        // Longest prefix first so the most specific registration wins.
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Find the backend responsible for `operation`.
    pub fn resolve(&self, operation: &str) -> Option<&Arc<dyn LlmBackend>> {
        self.exact.get(operation).or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| operation.starts_with(prefix.as_str()))
                .map(|(_, backend)| backend)
        })
    }

    /// Like [`resolve`](Self::resolve) but reports a missing route as an error.
    pub fn require(&self, operation: &str) -> Result<&Arc<dyn LlmBackend>, LlmError> {
        self.resolve(operation)
            .ok_or_else(|| LlmError::UnknownOperation(operation.to_string()))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LlmBackend for BackendRouter {
    async fn invoke(&self, operation: &str, messages: &[Message]) -> BackendReply {
        match self.resolve(operation) {
            Some(backend) => backend.invoke(operation, messages).await,
            None => {
                tracing::error!(operation = operation, "No backend registered for operation");
                BackendReply::Blocked(format!("no backend for operation '{operation}'"))
            }
        }
    }
}
