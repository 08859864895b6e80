//! Anthropic Messages API reasoning backend.
//!
//! Streams responses from `/v1/messages`. Only `text_delta` content is
//! spoken; an `error` event mid-stream ends the response with an adapter
//! error.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use rusty_dial_core::config::ReasoningProviderConfig;
use rusty_dial_core::error::AdapterError;
use rusty_dial_core::history::ContextTurn;

use crate::sse::sse_events;
use crate::{DEFAULT_PERSONA, ReasoningBackend, ReasoningRequest, TextStream, system_prompt};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

pub struct AnthropicBackend {
    pub base_url: String,
    api_key: String,
    pub model: String,
    max_tokens: u32,
    temperature: Option<f64>,
    persona: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn from_config(config: &ReasoningProviderConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No API key configured for reasoning provider '{}'", config.provider))?;
        // OpenRouter slugs ("vendor/model", the config default) are not
        // Anthropic model ids.
        let model = if config.model.contains('/') {
            DEFAULT_MODEL.to_string()
        } else {
            config.model.clone()
        };
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            persona: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            client: reqwest::Client::new(),
        })
    }

    /// Messages for a request. The API wants strictly alternating roles
    /// starting with the user, so consecutive turns of one side are merged
    /// and agent turns before the first caller turn (a greeting) are dropped.
    pub fn build_messages(&self, request: &ReasoningRequest) -> Vec<serde_json::Value> {
        let turns = request
            .context
            .iter()
            .map(|turn| match turn {
                ContextTurn::Caller(input) => ("user", input.render()),
                ContextTurn::Agent(text) => ("assistant", text.clone()),
            })
            .chain(std::iter::once(("user", request.input.render())))
            .skip_while(|(role, _)| *role == "assistant");

        let mut merged: Vec<(&str, String)> = Vec::new();
        for (role, content) in turns {
            match merged.last_mut() {
                Some((last, text)) if *last == role => {
                    text.push_str("\n\n");
                    text.push_str(&content);
                }
                _ => merged.push((role, content)),
            }
        }
        merged
            .into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    system: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

fn parse_event(data: &str) -> Option<StreamEvent> {
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(e) => {
            trace!(%e, data, "Failed to parse Anthropic event");
            None
        }
    }
}

fn stream_error(error: ApiError) -> AdapterError {
    let message = format!("{}: {}", error.kind, error.message);
    match error.kind.as_str() {
        "overloaded_error" | "api_error" | "rate_limit_error" => AdapterError::transient("anthropic", message),
        _ => AdapterError::fatal("anthropic", message),
    }
}

#[async_trait]
impl ReasoningBackend for AnthropicBackend {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: ReasoningRequest) -> Result<TextStream, AdapterError> {
        let body = MessagesRequest {
            model: self.model.clone(),
            system: system_prompt(&self.persona, &request),
            messages: self.build_messages(&request),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(call_id = %request.call_id, model = %body.model, "Streaming Anthropic Messages API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transient("anthropic", e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status("anthropic", status, &body));
        }

        let cancel = request.cancel.clone();
        let deltas = sse_events(response, "reasoning")
            .take_until(async move { cancel.cancelled().await })
            .map(|event| event.map(|e| parse_event(e.data.trim())))
            .take_while(|event| futures::future::ready(!matches!(event, Ok(Some(StreamEvent::MessageStop)))))
            .filter_map(|event| async move {
                match event {
                    Ok(Some(StreamEvent::ContentBlockDelta {
                        delta: BlockDelta::TextDelta { text },
                    })) if !text.is_empty() => Some(Ok(text)),
                    Ok(Some(StreamEvent::Error { error })) => Some(Err(stream_error(error))),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusty_dial_core::isolation::{has_untrusted_marker, wrap};
    use rusty_dial_core::types::CallId;
    use tokio_util::sync::CancellationToken;

    fn backend() -> AnthropicBackend {
        let config: ReasoningProviderConfig =
            serde_json::from_value(json!({ "provider": "anthropic", "api_key": "sk-ant-test" })).unwrap();
        AnthropicBackend::from_config(&config).unwrap()
    }

    #[test]
    fn test_from_config() {
        let config: ReasoningProviderConfig = serde_json::from_value(json!({ "provider": "anthropic" })).unwrap();
        assert!(AnthropicBackend::from_config(&config).is_err());

        let b = backend();
        assert_eq!(b.base_url, ANTHROPIC_BASE_URL);
        assert_eq!(b.model, DEFAULT_MODEL);
        assert_eq!(b.id(), "anthropic");
    }

    #[test]
    fn test_messages_alternate_and_start_with_caller() {
        let request = ReasoningRequest {
            call_id: CallId::new(),
            input: wrap("Entä huomenna?"),
            context: vec![
                ContextTurn::Agent("Hei, täällä Rusty.".into()),
                ContextTurn::Caller(wrap("Kerro sää")),
                ContextTurn::Agent("Aurinkoista.".into()),
                ContextTurn::Agent("Jotain muuta?".into()),
            ],
            call_context: String::new(),
            cancel: CancellationToken::new(),
        };
        let messages = backend().build_messages(&request);
        let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, ["user", "assistant", "user"]);
        assert_eq!(messages[1]["content"], "Aurinkoista.\n\nJotain muuta?");
        for msg in messages.iter().filter(|m| m["role"] == "user") {
            assert!(has_untrusted_marker(msg["content"].as_str().unwrap()));
        }
    }

    #[test]
    fn test_parse_event() {
        let event = parse_event(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hei"}}"#);
        assert!(matches!(
            event,
            Some(StreamEvent::ContentBlockDelta { delta: BlockDelta::TextDelta { text } }) if text == "Hei"
        ));
        assert!(matches!(parse_event(r#"{"type":"ping"}"#), Some(StreamEvent::Other)));
        assert!(matches!(parse_event(r#"{"type":"message_stop"}"#), Some(StreamEvent::MessageStop)));
        assert!(parse_event("not json").is_none());

        let err = stream_error(ApiError {
            kind: "overloaded_error".into(),
            message: "Overloaded".into(),
        });
        assert!(err.is_transient());
    }
}
