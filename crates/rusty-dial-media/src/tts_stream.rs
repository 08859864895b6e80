//! Streaming TTS: yields PCM chunks as they arrive from ElevenLabs.
//!
//! Audio is raw PCM 16-bit 16kHz mono. HTTP chunk boundaries can split a
//! sample, so the stream re-aligns chunks to whole samples.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::debug;

use rusty_dial_core::config::TtsProviderConfig;
use rusty_dial_core::error::AdapterError;
use rusty_dial_providers::{AudioStream, TtsAdapter, VoiceConfig};

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM"; // Rachel
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_FORMAT: &str = "pcm_16000";

pub struct ElevenLabsTts {
    base_url: String,
    api_key: String,
    voice: String,
    model: String,
    output_format: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn from_config(config: &TtsProviderConfig) -> anyhow::Result<Self> {
        if config.provider != "elevenlabs" {
            anyhow::bail!("Unsupported TTS provider '{}'", config.provider);
        }
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            voice: config.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            output_format: config
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            client: reqwest::Client::new(),
        })
    }

    /// Streaming endpoint for a voice.
    pub fn stream_url(&self, voice: &str) -> String {
        build_tts_url(&self.base_url, voice, &self.output_format)
    }
}

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_tts_url(base_url: &str, voice: &str, output_format: &str) -> String {
    format!("{base_url}/v1/text-to-speech/{voice}/stream?output_format={output_format}")
}

/// Re-chunk a byte stream so every chunk holds whole 16-bit samples.
///
/// A dangling byte at the very end of the stream is dropped.
pub fn align_pcm<S, E>(inner: S, adapter: &'static str) -> impl Stream<Item = Result<Bytes, AdapterError>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    futures::stream::unfold((Box::pin(inner), BytesMut::new()), move |(mut inner, mut carry)| async move {
        loop {
            match inner.next().await {
                Some(Ok(bytes)) => {
                    carry.extend_from_slice(&bytes);
                    let whole = carry.len() & !1;
                    if whole == 0 {
                        continue;
                    }
                    let chunk = carry.split_to(whole).freeze();
                    return Some((Ok(chunk), (inner, carry)));
                }
                Some(Err(e)) => {
                    return Some((Err(AdapterError::transient(adapter, e)), (inner, carry)));
                }
                None => return None,
            }
        }
    })
}

#[async_trait]
impl TtsAdapter for ElevenLabsTts {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioStream, AdapterError> {
        let voice_id = voice.voice.as_deref().unwrap_or(&self.voice);
        let model = voice.model.as_deref().unwrap_or(&self.model);
        let url = self.stream_url(voice_id);

        debug!(voice = voice_id, model, text_len = text.len(), "Starting TTS stream");

        let mut body = serde_json::json!({
            "text": text,
            "model_id": model,
        });
        if let Some(language) = &voice.language {
            body["language_code"] = serde_json::Value::String(language.clone());
        }

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transient("elevenlabs", e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status("elevenlabs", status, &body));
        }

        Ok(Box::pin(align_pcm(resp.bytes_stream(), "elevenlabs")))
    }
}
