//! LLM integration for memo-forge.
//!
//! This module wraps remote text-generation backends so that a batch of
//! calls is cheap to repeat and tolerant of failures.
//!
//! # Memoized calls
//!
//! [`RetryingCaller`] consults the [`PersistentCache`] before every call and
//! stores each validated result, so a rerun of the same batch only pays for
//! what is still missing:
//!
//! ```ignore
//! use memo_forge::llm::{ExtractJson, Message, PersistentCache, RetryingCaller};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(PersistentCache::new(".cache-forge.json"));
//! let caller = RetryingCaller::new(backend, cache);
//! let processors: Vec<Arc<dyn PostProcessor>> = vec![Arc::new(ExtractJson)];
//! let answer = caller.call("gpt-4o", &[Message::user("...")], &processors).await;
//! ```
//!
//! # Backend routing
//!
//! [`BackendRouter`] dispatches each operation id to a configured
//! [`LiteLlmClient`], by exact name first and then by longest prefix:
//!
//! ```ignore
//! use memo_forge::config::ForgeConfig;
//! use memo_forge::llm::BackendRouter;
//!
//! let config = ForgeConfig::load("forge.yaml")?;
//! let router = BackendRouter::from_config(&config)?;
//! ```

pub mod cache;
pub mod caller;
pub mod litellm;
pub mod postprocess;
pub mod router;

pub use cache::{
    is_present, is_usable, CacheEntry, CacheStats, CacheSummary, CallKey, EntryState,
    PersistentCache, BLOCKED_SENTINEL,
};
pub use caller::{AuditRecord, RetryPolicy, RetryingCaller, DEFAULT_MAX_RETRIES};
pub use litellm::{classify_failure, BackendReply, LiteLlmClient, LlmBackend, Message};
pub use postprocess::{apply_all, ExtractJson, PostProcessor, RequireFields};
pub use router::BackendRouter;
