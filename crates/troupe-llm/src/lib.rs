pub mod providers;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use troupe_core::config::ModelConfig;
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Builds a client for one model configuration.
pub type ClientFactory = Arc<dyn Fn(&ModelConfig) -> Box<dyn LlmClient> + Send + Sync>;

/// Provider tag → client constructor.
///
/// Agents resolve their client once, at construction, through this map.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the OpenAI, Anthropic, and OpenAI-compatible preset providers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("openai", |_| Box::new(OpenAiClient::new()));
        registry.register("anthropic", |_| Box::new(AnthropicClient::new()));
        registry.register("claude", |_| Box::new(AnthropicClient::new()));
        for name in providers::presets::all_preset_names() {
            registry.register(name, |_| Box::new(OpenAiClient::new()));
        }
        registry
    }

    /// Register (or replace) a provider.
    pub fn register<F>(&mut self, provider: &str, factory: F)
    where
        F: Fn(&ModelConfig) -> Box<dyn LlmClient> + Send + Sync + 'static,
    {
        self.factories.insert(provider.to_string(), Arc::new(factory));
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a client for `config`, applying preset defaults and retry wrapping.
    ///
    /// Returns the client together with the effective model config.
    pub fn create_client(
        &self,
        config: &ModelConfig,
    ) -> Result<(Arc<dyn LlmClient>, ModelConfig)> {
        let factory = self
            .factories
            .get(&config.provider)
            .ok_or_else(|| TroupeError::UnsupportedProvider(config.provider.clone()))?;

        let effective = apply_preset(config)?;
        let client = factory(&effective);

        debug!(provider = %effective.provider, model = %effective.model_id, "Resolved LLM client");

        let client: Arc<dyn LlmClient> = match &effective.retry {
            Some(retry) => Arc::new(RetryingClient::new(client, retry.clone())),
            None => Arc::from(client),
        };
        Ok((client, effective))
    }
}

/// Fill in base URL and headers for OpenAI-compatible presets.
fn apply_preset(config: &ModelConfig) -> Result<ModelConfig> {
    let mut effective = config.clone();
    if let Some(preset) = providers::presets::get_preset(&config.provider) {
        if effective.base_url.is_none() {
            effective.base_url = Some(preset.default_base_url.to_string());
        }
        if preset.needs_api_key && effective.api_key.is_none() {
            return Err(TroupeError::Config(format!(
                "Provider '{}' requires an api_key",
                config.provider
            )));
        }
        effective.extra_headers =
            providers::presets::build_extra_headers(preset, &config.extra_headers);
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_test_utils::ScriptedLlm;

    #[test]
    fn unknown_provider_is_rejected() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry
            .create_client(&ModelConfig::new("carrier-pigeon", "coo"))
            .err()
            .unwrap();
        assert!(matches!(err, TroupeError::UnsupportedProvider(p) if p == "carrier-pigeon"));
    }

    #[test]
    fn preset_fills_base_url() {
        let registry = ProviderRegistry::with_builtins();
        let (_, effective) = registry
            .create_client(&ModelConfig::new("ollama", "llama3"))
            .unwrap();
        assert_eq!(
            effective.base_url.as_deref(),
            Some("http://localhost:11434/v1/chat/completions")
        );
    }

    #[test]
    fn preset_requires_key() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry
            .create_client(&ModelConfig::new("groq", "llama"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires an api_key"));
    }

    #[tokio::test]
    async fn custom_provider_is_used() {
        let mut registry = ProviderRegistry::new();
        registry.register("mock", |_| {
            Box::new(ScriptedLlm::new(vec![r#"{"finalAnswer": "hi"}"#]))
        });
        assert_eq!(registry.providers(), vec!["mock"]);

        let (client, config) = registry
            .create_client(&ModelConfig::new("mock", "m"))
            .unwrap();
        let resp = client.chat(&config, vec![]).await.unwrap();
        assert!(resp.text.contains("hi"));
    }
}
