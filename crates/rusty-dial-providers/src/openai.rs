//! OpenAI Chat Completions reasoning backend.
//!
//! Streams responses from `/v1/chat/completions`. Also serves OpenRouter and
//! other OpenAI-compatible endpoints.

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

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";

/// API style: determines minor request differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
}

pub struct OpenAiBackend {
    pub base_url: String,
    pub api_style: ApiStyle,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f64>,
    persona: String,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    /// Build a backend from config. Fails when no API key can be resolved.
    pub fn from_config(config: &ReasoningProviderConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No API key configured for reasoning provider '{}'", config.provider))?;
        let (api_style, default_base) = match config.provider.as_str() {
            "openai" => (ApiStyle::OpenAi, OPENAI_BASE_URL),
            "openrouter" => (ApiStyle::OpenRouter, OPENROUTER_BASE_URL),
            other => anyhow::bail!("Unsupported reasoning provider '{other}'"),
        };
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(default_base)
                .trim_end_matches('/')
                .to_string(),
            api_style,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            persona: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            provider_id: config.provider.clone(),
            client: reqwest::Client::new(),
        })
    }

    /// Chat messages for a request. Caller turns are only ever the rendered,
    /// marked form of their [`TaggedInput`](rusty_dial_core::isolation::TaggedInput).
    pub fn build_messages(&self, request: &ReasoningRequest) -> Vec<serde_json::Value> {
        let system = system_prompt(&self.persona, request);
        let mut messages = vec![json!({ "role": "system", "content": system })];
        for turn in &request.context {
            match turn {
                ContextTurn::Caller(input) => {
                    messages.push(json!({ "role": "user", "content": input.render() }));
                }
                ContextTurn::Agent(text) => {
                    messages.push(json!({ "role": "assistant", "content": text }));
                }
            }
        }
        messages.push(json!({ "role": "user", "content": request.input.render() }));
        messages
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the text delta from one streamed `data:` payload.
fn parse_delta(data: &str) -> Option<String> {
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse OpenAI chunk");
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
}

#[async_trait]
impl ReasoningBackend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn generate(&self, request: ReasoningRequest) -> Result<TextStream, AdapterError> {
        let body = OpenAiRequest {
            model: self.model.clone(),
            messages: self.build_messages(&request),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(call_id = %request.call_id, model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key));
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "Rusty Dial");
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transient(self.provider_id.clone(), e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(self.provider_id.clone(), status, &body));
        }

        let cancel = request.cancel.clone();
        let deltas = sse_events(response, "reasoning")
            .take_until(async move { cancel.cancelled().await })
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(e) => parse_delta(e.data.trim()).map(Ok),
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(deltas))
    }
}
