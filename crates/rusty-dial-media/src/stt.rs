//! Whisper-style transcription (Groq / OpenAI) fed by energy-VAD speech
//! segments.
//!
//! The endpoint is batch-only, so each call session cuts inbound audio into
//! speech segments and transcribes them one at a time, in order. Every
//! segment yields a single final transcript event.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use rusty_dial_core::config::SttProviderConfig;
use rusty_dial_core::error::AdapterError;
use rusty_dial_core::types::{AudioFrame, CallId, TranscriptEvent};
use rusty_dial_providers::{SttAdapter, SttSession};

use crate::SAMPLE_RATE;
use crate::vad::{EnergyVad, VadEdge};

const DEFAULT_MODEL: &str = "whisper-large-v3-turbo";

/// Whisper reports no confidence; finals are assumed good.
const WHISPER_CONFIDENCE: f32 = 0.9;

/// Inbound frames buffered while a segment is being transcribed.
const FRAME_BUFFER: usize = 500;

/// Frames kept from before speech onset so the first syllable is not clipped.
const PREROLL_FRAMES: usize = 10;

/// Shorter segments are treated as noise (250 ms).
const MIN_SEGMENT_SAMPLES: usize = SAMPLE_RATE as usize / 4;

/// Longer segments are cut and sent as they are (30 s).
const MAX_SEGMENT_SAMPLES: usize = SAMPLE_RATE as usize * 30;

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32) -> Vec<u8> {
    const CHANNELS: u16 = 1;
    const BITS: u16 = 16;
    let data_len = (pcm.len() * 2) as u32;
    let byte_rate = sample_rate * u32::from(CHANNELS) * u32::from(BITS) / 8;
    let block_align = CHANNELS * BITS / 8;

    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// Transcription endpoint for a provider.
pub fn provider_url(provider: &str, base_url: Option<&str>) -> String {
    if let Some(base) = base_url {
        return format!("{}/v1/audio/transcriptions", base.trim_end_matches('/'));
    }
    match provider {
        "openai" => "https://api.openai.com/v1/audio/transcriptions".into(),
        _ => "https://api.groq.com/openai/v1/audio/transcriptions".into(),
    }
}

/// One VAD-delimited stretch of caller speech.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    pub pcm: Vec<i16>,
    /// Media timestamp of the first frame, including pre-roll.
    pub started_at_ms: u64,
}

/// Cuts a frame stream into speech segments.
#[derive(Debug)]
pub struct SpeechSegmenter {
    vad: EnergyVad,
    preroll: VecDeque<AudioFrame>,
    pcm: Vec<i16>,
    started_at_ms: u64,
}

impl SpeechSegmenter {
    pub fn new(threshold: f64, silence_frames: usize) -> Self {
        Self {
            vad: EnergyVad::new(threshold, silence_frames),
            preroll: VecDeque::with_capacity(PREROLL_FRAMES),
            pcm: Vec::new(),
            started_at_ms: 0,
        }
    }

    pub fn push(&mut self, frame: AudioFrame) -> Option<SpeechSegment> {
        match self.vad.push(&frame) {
            Some(VadEdge::SpeechStart) => {
                self.pcm.clear();
                self.started_at_ms = self
                    .preroll
                    .front()
                    .map_or(frame.timestamp_ms, |f| f.timestamp_ms);
                for earlier in self.preroll.drain(..) {
                    self.pcm.extend_from_slice(&earlier.samples);
                }
                self.pcm.extend_from_slice(&frame.samples);
                None
            }
            Some(VadEdge::SpeechEnd) => {
                self.pcm.extend_from_slice(&frame.samples);
                self.take()
            }
            None if self.vad.is_active() => {
                self.pcm.extend_from_slice(&frame.samples);
                if self.pcm.len() >= MAX_SEGMENT_SAMPLES {
                    let segment = self.take();
                    self.started_at_ms = frame.timestamp_ms;
                    return segment;
                }
                None
            }
            None => {
                if self.preroll.len() == PREROLL_FRAMES {
                    self.preroll.pop_front();
                }
                self.preroll.push_back(frame);
                None
            }
        }
    }

    /// Whatever speech is buffered when the stream ends.
    pub fn finish(&mut self) -> Option<SpeechSegment> {
        self.take()
    }

    fn take(&mut self) -> Option<SpeechSegment> {
        let pcm = std::mem::take(&mut self.pcm);
        (pcm.len() >= MIN_SEGMENT_SAMPLES).then(|| SpeechSegment {
            pcm,
            started_at_ms: self.started_at_ms,
        })
    }
}

struct WhisperInner {
    provider: String,
    url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    client: reqwest::Client,
}

pub struct WhisperStt {
    inner: Arc<WhisperInner>,
    vad_threshold: f64,
    silence_frames: usize,
}

impl WhisperStt {
    pub fn from_config(config: &SttProviderConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;
        match config.provider.as_str() {
            "groq" | "openai" => {}
            other => anyhow::bail!("Unsupported STT provider '{other}'"),
        }
        Ok(Self {
            inner: Arc::new(WhisperInner {
                provider: config.provider.clone(),
                url: provider_url(&config.provider, config.base_url.as_deref()),
                api_key,
                model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                language: config.language.clone(),
                client: reqwest::Client::new(),
            }),
            vad_threshold: config.vad_threshold,
            silence_frames: config.silence_frames,
        })
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

impl WhisperInner {
    async fn transcribe(&self, pcm: &[i16]) -> Result<TranscriptionResponse, AdapterError> {
        let wav = pcm_to_wav(pcm, SAMPLE_RATE);
        debug!(url = %self.url, model = %self.model, wav_bytes = wav.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| AdapterError::fatal(self.provider.clone(), e))?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AdapterError::transient(self.provider.clone(), e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(self.provider.clone(), status, &body));
        }

        resp.json::<TranscriptionResponse>()
            .await
            .map_err(|e| AdapterError::transient(self.provider.clone(), e))
    }
}

#[async_trait]
impl SttAdapter for WhisperStt {
    fn id(&self) -> &str {
        &self.inner.provider
    }

    async fn open(&self, call_id: CallId) -> Result<SttSession, AdapterError> {
        let (frames_tx, mut frames_rx) = mpsc::channel::<AudioFrame>(FRAME_BUFFER);
        let (segments_tx, mut segments_rx) = mpsc::unbounded_channel::<SpeechSegment>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut segmenter = SpeechSegmenter::new(self.vad_threshold, self.silence_frames);
        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if let Some(segment) = segmenter.push(frame) {
                    let _ = segments_tx.send(segment);
                }
            }
            if let Some(segment) = segmenter.finish() {
                let _ = segments_tx.send(segment);
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!(%call_id, provider = %inner.provider, "Transcription session started");
            while let Some(segment) = segments_rx.recv().await {
                let event = match inner.transcribe(&segment.pcm).await {
                    Ok(resp) if resp.text.trim().is_empty() => continue,
                    Ok(resp) => Ok(TranscriptEvent {
                        text: resp.text.trim().to_string(),
                        is_final: true,
                        confidence: WHISPER_CONFIDENCE,
                        timestamp_ms: segment.started_at_ms,
                        language: resp.language.or_else(|| inner.language.clone()),
                    }),
                    Err(e) => {
                        warn!(%call_id, error = %e, "Transcription failed");
                        Err(e)
                    }
                };
                if events_tx.send(event).is_err() {
                    debug!(%call_id, "Transcript receiver dropped, stopping session");
                    break;
                }
            }
            info!(%call_id, "Transcription session ended");
        });

        Ok(SttSession {
            frames: frames_tx,
            events: Box::pin(UnboundedReceiverStream::new(events_rx)),
        })
    }
}
