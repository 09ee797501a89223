//! Configuration for batch runs.
//!
//! A [`ForgeConfig`] can be loaded from a JSON or YAML file; every field has a
//! default, so an empty document (or no file at all) is a valid configuration.
//! Command-line flags are applied on top by the CLI.
//!
//! ```yaml
//! cache:
//!   path: .cache-forge.json
//! pool:
//!   concurrency: 3
//!   checkpoint_every: 10
//! retry:
//!   max_retries: 3
//!   backoff_ms: 0
//! audit_log: logs/responses.jsonl
//! backends:
//!   gpt:
//!     api_base: https://api.openai.com/v1
//!     api_key_env: OPENAI_API_KEY
//!     model: gpt-4o-mini
//!     prefix: gpt
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::litellm::DEFAULT_TIMEOUT_SECS;

/// Default cache file name.
pub const DEFAULT_CACHE_PATH: &str = ".cache-forge.json";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub cache: CacheSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    /// Where to append raw backend exchanges. Disabled when unset.
    pub audit_log: Option<PathBuf>,
    /// Backends by name; the name doubles as the exact operation id.
    pub backends: BTreeMap<String, BackendSettings>,
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub path: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CACHE_PATH),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of workers running tasks at once.
    pub concurrency: usize,
    /// Write a checkpoint every this many completed tasks.
    pub checkpoint_every: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            checkpoint_every: 10,
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 0,
        }
    }
}

/// One OpenAI-compatible backend endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key, used when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Also serve every operation id starting with this prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl BackendSettings {
    /// Creates settings for `model` served at `api_base`.
    pub fn new(api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: None,
            api_key_env: None,
            model: model.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            prefix: None,
        }
    }

    /// Builder method to read the API key from an environment variable.
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    /// Builder method to route an operation prefix to this backend.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// The literal `api_key`, or else the value of `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

impl ForgeConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates a configuration file.
    ///
    /// The format is chosen by extension: `.json`, `.yaml` or `.yml`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, has an unknown
    /// extension, fails to parse, or holds invalid values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&content)?,
            "yaml" | "yml" => {
                if content.trim().is_empty() {
                    Self::default()
                } else {
                    serde_yaml::from_str(&content)?
                }
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        tracing::debug!(path = %path.display(), backends = config.backends.len(), "Configuration loaded");
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache.path cannot be empty".to_string()));
        }

        if self.pool.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pool.concurrency must be greater than 0".to_string(),
            ));
        }

        if self.pool.checkpoint_every == 0 {
            return Err(ConfigError::Invalid(
                "pool.checkpoint_every must be greater than 0".to_string(),
            ));
        }

        for (name, backend) in &self.backends {
            if backend.api_base.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backends.{name}.api_base cannot be empty"
                )));
            }
            if backend.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backends.{name}.model cannot be empty"
                )));
            }
            if backend.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backends.{name}.timeout_secs must be greater than 0"
                )));
            }
            if backend.prefix.as_deref() == Some("") {
                return Err(ConfigError::Invalid(format!(
                    "backends.{name}.prefix cannot be empty"
                )));
            }
        }

        Ok(())
    }

    /// Builder method to set the cache file.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache.path = path.into();
        self
    }

    /// Builder method to set worker concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.pool.concurrency = concurrency;
        self
    }

    /// Builder method to set the checkpoint interval.
    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.pool.checkpoint_every = every;
        self
    }

    /// Builder method to set max retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    /// Builder method to set the audit log file.
    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log = Some(path.into());
        self
    }

    /// Builder method to add a backend.
    pub fn with_backend(mut self, name: impl Into<String>, settings: BackendSettings) -> Self {
        self.backends.insert(name.into(), settings);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ForgeConfig::default();
        assert_eq!(config.cache.path, PathBuf::from(".cache-forge.json"));
        assert_eq!(config.pool.concurrency, 3);
        assert_eq!(config.pool.checkpoint_every, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.backoff_ms, 0);
        assert!(config.audit_log.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.yaml");
        fs::write(
            &path,
            r#"
pool:
  concurrency: 8
backends:
  gpt:
    api_base: http://localhost:4000/v1
    model: gpt-4o-mini
    prefix: gpt
"#,
        )
        .unwrap();

        let config = ForgeConfig::load(&path).unwrap();
        assert_eq!(config.pool.concurrency, 8);
        assert_eq!(config.pool.checkpoint_every, 10);
        let gpt = &config.backends["gpt"];
        assert_eq!(gpt.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(gpt.prefix.as_deref(), Some("gpt"));
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.json");
        fs::write(
            &path,
            r#"{"cache": {"path": "c.json"}, "retry": {"max_retries": 5, "backoff_ms": 250}}"#,
        )
        .unwrap();

        let config = ForgeConfig::load(&path).unwrap();
        assert_eq!(config.cache.path, PathBuf::from("c.json"));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_ms, 250);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.yml");
        fs::write(&path, "").unwrap();
        assert_eq!(ForgeConfig::load(&path).unwrap(), ForgeConfig::default());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.toml");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            ForgeConfig::load(&path),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "toml"
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = ForgeConfig::load("/nonexistent/forge.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = ForgeConfig::default().with_concurrency(0);
        assert!(config.validate().is_err());
        let config = ForgeConfig::default().with_checkpoint_every(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_incomplete_backend() {
        let config = ForgeConfig::default().with_backend("gpt", BackendSettings::new("", "gpt-4o"));
        assert!(config.validate().is_err());
        let config = ForgeConfig::default()
            .with_backend("gpt", BackendSettings::new("http://x", "gpt-4o").with_prefix(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_api_key_prefers_literal() {
        let mut settings = BackendSettings::new("http://x", "m")
            .with_api_key_env("MEMO_FORGE_TEST_KEY_THAT_IS_NEVER_SET");
        assert_eq!(settings.resolve_api_key(), None);
        settings.api_key = Some("sk-literal".to_string());
        assert_eq!(settings.resolve_api_key(), Some("sk-literal".to_string()));
    }
}
