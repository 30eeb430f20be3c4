//! Client configuration with defaults and environment loading.

use std::time::Duration;

use crate::api::retry::RetryConfig;
use crate::provider::Provider;
use crate::{DEFAULT_MAX_RESPONSE_SIZE, DEFAULT_TIMEOUT_MS};

/// Background worker settings for [`ExecutionSlot`](crate::slot::ExecutionSlot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    /// Worker thread name. Default: `"microchat-worker"`.
    pub thread_name: String,
    /// Worker stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            thread_name: "microchat-worker".to_string(),
            stack_size: None,
        }
    }
}

/// Settings for a [`ChatClient`](crate::client::ChatClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Vendor to talk to. Default: OpenAI.
    pub provider: Provider,
    /// Vendor API key. Not needed for Ollama.
    pub api_key: String,
    /// Model identifier. Empty selects the provider's default model.
    pub model: String,
    /// Replaces the vendor endpoint (useful for proxies and local servers).
    pub base_url: Option<String>,
    /// Per-request timeout. Default: 30 s.
    pub timeout: Duration,
    /// Cap on buffered response bodies. Default: 64 KiB.
    pub max_response_size: usize,
    pub retry: RetryConfig,
    pub slot: SlotConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            api_key: String::new(),
            model: String::new(),
            base_url: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            retry: RetryConfig::default(),
            slot: SlotConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Load from `MICROCHAT_PROVIDER`, `MICROCHAT_API_KEY`, `MICROCHAT_MODEL`
    /// and `MICROCHAT_BASE_URL`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::default();
        if let Some(provider) = get("MICROCHAT_PROVIDER") {
            config.provider = provider.parse()?;
        }
        if let Some(key) = get("MICROCHAT_API_KEY") {
            config.api_key = key;
        }
        if let Some(model) = get("MICROCHAT_MODEL") {
            config.model = model;
        }
        config.base_url = get("MICROCHAT_BASE_URL");
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_response_size(mut self, max: usize) -> Self {
        self.max_response_size = max;
        self
    }

    /// Enable retrying with up to `max_retries` extra attempts.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.enabled = true;
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_slot(mut self, slot: SlotConfig) -> Self {
        self.slot = slot;
        self
    }

    /// Model that will actually be sent: the configured one, or the
    /// provider default when empty.
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.provider, Provider::OpenAi);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_response_size, 64 * 1024);
        assert!(!config.retry.enabled);
        assert_eq!(config.effective_model(), "gpt-4.1-mini");
        assert_eq!(config.slot.thread_name, "microchat-worker");
    }

    #[test]
    fn builders() {
        let config = ClientConfig::new(Provider::Anthropic, "sk")
            .with_model("claude-x")
            .with_retries(5)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.api_key, "sk");
        assert_eq!(config.effective_model(), "claude-x");
        assert!(config.retry.enabled);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn from_lookup_reads_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MICROCHAT_PROVIDER", "Gemini"),
            ("MICROCHAT_API_KEY", "g-key"),
            ("MICROCHAT_BASE_URL", "http://localhost:8080"),
            ("MICROCHAT_MODEL", "  "),
        ]);
        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.api_key, "g-key");
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.effective_model(), "gemini-2.0-flash");
    }

    #[test]
    fn from_lookup_rejects_unknown_provider() {
        let err = ClientConfig::from_lookup(|k| {
            (k == "MICROCHAT_PROVIDER").then(|| "mistral".to_string())
        })
        .unwrap_err();
        assert!(err.contains("mistral"));
    }
}
