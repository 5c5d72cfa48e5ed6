//! OpenAI-compatible hosts reachable through the OpenAI client.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const fn preset(name: &'static str, default_base_url: &'static str, needs_api_key: bool) -> ProviderPreset {
    ProviderPreset {
        name,
        default_base_url,
        needs_api_key,
        extra_headers: &[],
    }
}

static PRESETS: &[ProviderPreset] = &[
    preset("ollama", "http://localhost:11434/v1/chat/completions", false),
    preset("groq", "https://api.groq.com/openai/v1/chat/completions", true),
    ProviderPreset {
        name: "openrouter",
        default_base_url: "https://openrouter.ai/api/v1/chat/completions",
        needs_api_key: true,
        extra_headers: &[("X-Title", "Troupe")],
    },
    preset("together", "https://api.together.xyz/v1/chat/completions", true),
    preset("mistral", "https://api.mistral.ai/v1/chat/completions", true),
    preset("deepseek", "https://api.deepseek.com/v1/chat/completions", true),
];

pub fn get_preset(provider: &str) -> Option<&'static ProviderPreset> {
    PRESETS.iter().find(|p| p.name == provider)
}

pub fn all_preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|p| p.name)
}

/// Preset headers with the user's configured headers layered on top.
pub fn build_extra_headers(
    preset: &ProviderPreset,
    user_headers: &HashMap<String, String>,
) -> HashMap<String, String> {
    preset
        .extra_headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain(user_headers.iter().map(|(k, v)| (k.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_preset_resolves() {
        for name in all_preset_names() {
            assert_eq!(get_preset(name).map(|p| p.name), Some(name));
        }
        assert!(get_preset("anthropic").is_none());
    }

    #[test]
    fn user_headers_override_preset() {
        let preset = get_preset("openrouter").unwrap();
        let user = HashMap::from([
            ("X-Title".to_string(), "Mine".to_string()),
            ("X-Extra".to_string(), "1".to_string()),
        ]);
        let headers = build_extra_headers(preset, &user);
        assert_eq!(headers["X-Title"], "Mine");
        assert_eq!(headers["X-Extra"], "1");
    }
}
