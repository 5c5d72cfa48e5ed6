use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use troupe_core::config::ModelConfig;
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::LlmClient;
use troupe_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| OaiMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content,
        })
        .collect()
}

fn parse_response(body: &str) -> Result<LlmResponse> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| TroupeError::LlmRequest(format!("Malformed completion: {}", e)))?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| TroupeError::LlmRequest("Completion has no content".into()))?;

    let usage = parsed
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(LlmResponse { text, usage })
}

impl LlmClient for OpenAiClient {
    fn chat(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let config = config.clone();

        Box::pin(async move {
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: convert_messages(messages),
                max_tokens: config.max_tokens,
                temperature: if config.temperature > 0.0 {
                    Some(config.temperature)
                } else {
                    None
                },
                stream: false,
            };

            let mut req = self.http.post(base_url).json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            // Apply extra headers from config (set by presets or user)
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(model = %config.model_id, url = %base_url, "Sending chat completion");

            let response = req
                .send()
                .await
                .map_err(|e| TroupeError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| TroupeError::LlmRequest(e.to_string()))?;

            if !status.is_success() {
                return Err(TroupeError::LlmRequest(format!("HTTP {}: {}", status, text)));
            }

            parse_response(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_roles() {
        let msgs = convert_messages(vec![
            ChatMessage::system("rules"),
            ChatMessage::user("task"),
            ChatMessage::assistant("{}"),
        ]);
        let roles: Vec<_> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(msgs[1].content, "task");
    }

    #[test]
    fn parses_completion_with_usage() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"finalAnswer\": \"42\"}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        }"#;
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.text, r#"{"finalAnswer": "42"}"#);
        assert_eq!(resp.usage.input_tokens, 12);
        assert_eq!(resp.usage.output_tokens, 5);
    }

    #[test]
    fn empty_choices_is_an_error() {
        let err = parse_response(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, TroupeError::LlmRequest(_)));
    }
}
