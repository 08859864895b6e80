//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RustyDialError};

/// Top-level Rusty Dial configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls: Option<CallsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_taking: Option<TurnTakingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub barge_in: Option<BargeInConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<ProvidersConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Externally reachable base URL handed to telephony for media sockets
    /// (e.g. "wss://dial.example.com"). Defaults to the bind address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Telephony bridge notified with `{call_id, from, to, media_url}` when a
    /// call is dialed. Without it, clients poll `GET /calls` and connect the
    /// media socket themselves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial_webhook: Option<String>,

    /// Telephony bridge notified with `{call_id, to}` when a live call is
    /// transferred. The media socket always receives a `transfer` event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_webhook: Option<String>,
}

fn default_port() -> u16 {
    8302
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            public_url: None,
            dial_webhook: None,
            transfer_webhook: None,
        }
    }
}

/// Call admission and lifetime limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Maximum number of live calls (default: 5).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-call maximum duration in seconds (default: 600).
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// How often the duration sweeper runs, in ms (default: 1000).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Number of ended calls kept for history queries (default: 100).
    #[serde(default = "default_archive_size")]
    pub archive_size: usize,

    /// Destination glob patterns (`*`, `?`). Empty = allow all.
    #[serde(default)]
    pub allowed_destinations: Vec<String>,

    /// Destination prefixes that are always rejected.
    #[serde(default)]
    pub blocked_prefixes: Vec<String>,

    /// Number shown to callees on outbound calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,

    /// Prior exchanges passed to the reasoning backend (default: 10).
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Receives `incoming_call` and `call_ended` events as JSON POSTs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_duration_secs() -> u64 {
    600
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_archive_size() -> usize {
    100
}

fn default_history_turns() -> usize {
    10
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_duration_secs: default_max_duration_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            archive_size: default_archive_size(),
            allowed_destinations: Vec::new(),
            blocked_prefixes: Vec::new(),
            caller_id: None,
            history_turns: default_history_turns(),
            callback_url: None,
        }
    }
}

/// Silence waits used by the transcript segmenter, all in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnTakingConfig {
    /// Floor applied to every wait (default: 300).
    #[serde(default = "default_base_wait_ms")]
    pub base_wait_ms: u64,

    /// Wait after terminal punctuation (default: 300).
    #[serde(default = "default_punctuation_wait_ms")]
    pub punctuation_wait_ms: u64,

    /// Wait when the text has no terminal punctuation (default: 1200).
    #[serde(default = "default_no_punctuation_wait_ms")]
    pub no_punctuation_wait_ms: u64,

    /// Wait after a bare number, so digit sequences are not cut off (default: 2000).
    #[serde(default = "default_number_wait_ms")]
    pub number_wait_ms: u64,

    /// Hard ceiling on a single utterance (default: 15000).
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
}

fn default_base_wait_ms() -> u64 {
    300
}

fn default_punctuation_wait_ms() -> u64 {
    300
}

fn default_no_punctuation_wait_ms() -> u64 {
    1200
}

fn default_number_wait_ms() -> u64 {
    2000
}

fn default_max_utterance_ms() -> u64 {
    15_000
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        Self {
            base_wait_ms: default_base_wait_ms(),
            punctuation_wait_ms: default_punctuation_wait_ms(),
            no_punctuation_wait_ms: default_no_punctuation_wait_ms(),
            number_wait_ms: default_number_wait_ms(),
            max_utterance_ms: default_max_utterance_ms(),
        }
    }
}

/// Barge-in detection over inbound audio energy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BargeInConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// RMS energy (16-bit PCM) above which a frame counts as speech (default: 500).
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f64,

    /// Rolling window length in frames (default: 3).
    #[serde(default = "default_window_frames")]
    pub window_frames: usize,

    /// Loud frames required inside the window (default: 2).
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,
}

fn default_true() -> bool {
    true
}

fn default_energy_threshold() -> f64 {
    500.0
}

fn default_window_frames() -> usize {
    3
}

fn default_min_frames() -> usize {
    2
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: default_energy_threshold(),
            window_frames: default_window_frames(),
            min_frames: default_min_frames(),
        }
    }
}

/// Response pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries for transient adapter errors (default: 2).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries in ms, doubled per attempt (default: 200).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Force a text chunk boundary at this length (default: 512).
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// Outbound audio queue capacity in chunks (default: 32).
    #[serde(default = "default_outbound_buffer_chunks")]
    pub outbound_buffer_chunks: usize,

    /// Per-sentence synthesis buffer in chunks (default: 16).
    #[serde(default = "default_synthesis_buffer_chunks")]
    pub synthesis_buffer_chunks: usize,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_chunk_chars() -> usize {
    512
}

fn default_outbound_buffer_chunks() -> usize {
    32
}

fn default_synthesis_buffer_chunks() -> usize {
    16
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_chunk_chars: default_max_chunk_chars(),
            outbound_buffer_chunks: default_outbound_buffer_chunks(),
            synthesis_buffer_chunks: default_synthesis_buffer_chunks(),
        }
    }
}

/// What the caller hears when the call has to end on an internal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_text")]
    pub text: String,
}

fn default_fallback_text() -> String {
    "I'm sorry, something went wrong on my end and I have to hang up. Goodbye.".into()
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            text: default_fallback_text(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsProviderConfig>,
}

/// Streaming reasoning backend: OpenAI-compatible chat completions or the
/// Anthropic Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningProviderConfig {
    /// "openrouter" (default), "openai" or "anthropic".
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_reasoning_model")]
    pub model: String,

    #[serde(default = "default_reasoning_max_tokens")]
    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Persona / task instructions prepended to every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_reasoning_provider() -> String {
    "openrouter".into()
}

fn default_reasoning_model() -> String {
    "openai/gpt-4o-mini".into()
}

fn default_reasoning_max_tokens() -> u32 {
    300
}

impl ReasoningProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Whisper-style transcription endpoint fed by VAD-delimited speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttProviderConfig {
    /// "groq" (default) or "openai".
    #[serde(default = "default_stt_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Override the transcription endpoint base (e.g. a local Whisper server).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// ISO-639-1 hint passed to the model (e.g. "fi").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// RMS energy threshold for the speech detector (default: 300).
    #[serde(default = "default_stt_vad_threshold")]
    pub vad_threshold: f64,

    /// Silent 20 ms frames that close a speech segment (default: 15).
    #[serde(default = "default_stt_silence_frames")]
    pub silence_frames: usize,
}

fn default_stt_provider() -> String {
    "groq".into()
}

fn default_stt_vad_threshold() -> f64 {
    300.0
}

fn default_stt_silence_frames() -> usize {
    15
}

impl SttProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Streaming text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Output format (default: "pcm_16000").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl TtsProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "rusty_dial_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Validated, immutable per-call settings. Captured when a call opens and
/// never changed while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSettings {
    pub turn_taking: TurnTakingConfig,
    pub barge_in: BargeInConfig,
    pub pipeline: PipelineConfig,
    pub fallback_text: String,
    pub max_duration: Duration,
    pub history_turns: usize,
}

impl CallSettings {
    pub fn validate(&self) -> Result<()> {
        let tt = &self.turn_taking;
        if tt.base_wait_ms == 0 {
            return Err(RustyDialError::Config("turn_taking.base_wait_ms must be > 0".into()));
        }
        let longest_wait = tt
            .punctuation_wait_ms
            .max(tt.no_punctuation_wait_ms)
            .max(tt.number_wait_ms)
            .max(tt.base_wait_ms);
        if tt.max_utterance_ms <= longest_wait {
            return Err(RustyDialError::Config(format!(
                "turn_taking.max_utterance_ms ({}) must exceed every silence wait ({longest_wait})",
                tt.max_utterance_ms
            )));
        }

        let bi = &self.barge_in;
        if bi.window_frames == 0 || bi.min_frames == 0 || bi.min_frames > bi.window_frames {
            return Err(RustyDialError::Config(format!(
                "barge_in.min_frames ({}) must be between 1 and window_frames ({})",
                bi.min_frames, bi.window_frames
            )));
        }
        if bi.energy_threshold.is_nan() || bi.energy_threshold <= 0.0 {
            return Err(RustyDialError::Config(
                "barge_in.energy_threshold must be positive".into(),
            ));
        }

        let p = &self.pipeline;
        if p.max_chunk_chars < 16 {
            return Err(RustyDialError::Config(
                "pipeline.max_chunk_chars must be at least 16".into(),
            ));
        }
        if p.outbound_buffer_chunks == 0 || p.synthesis_buffer_chunks == 0 {
            return Err(RustyDialError::Config(
                "pipeline buffers must hold at least one chunk".into(),
            ));
        }

        if self.max_duration.is_zero() {
            return Err(RustyDialError::Config(
                "calls.max_duration_secs must be > 0".into(),
            ));
        }
        if self.fallback_text.trim().is_empty() {
            return Err(RustyDialError::Config("fallback.text must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            turn_taking: TurnTakingConfig::default(),
            barge_in: BargeInConfig::default(),
            pipeline: PipelineConfig::default(),
            fallback_text: default_fallback_text(),
            max_duration: Duration::from_secs(default_max_duration_secs()),
            history_turns: default_history_turns(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern must compile");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config =
            json5::from_str(&substituted).map_err(|e| RustyDialError::Config(e.to_string()))?;

        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file path: `~/.rusty_dial/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn calls(&self) -> CallsConfig {
        self.calls.clone().unwrap_or_default()
    }

    pub fn providers(&self) -> ProvidersConfig {
        self.providers.clone().unwrap_or_default()
    }

    /// Build the validated settings snapshot handed to each new call.
    pub fn call_settings(&self) -> Result<Arc<CallSettings>> {
        let calls = self.calls();
        let settings = CallSettings {
            turn_taking: self.turn_taking.clone().unwrap_or_default(),
            barge_in: self.barge_in.clone().unwrap_or_default(),
            pipeline: self.pipeline.clone().unwrap_or_default(),
            fallback_text: self.fallback.clone().unwrap_or_default().text,
            max_duration: Duration::from_secs(calls.max_duration_secs),
            history_turns: calls.history_turns,
        };
        settings.validate()?;
        Ok(Arc::new(settings))
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "calls.max_concurrent").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let providers = self.providers();
        match &providers.reasoning {
            Some(p) if p.resolve_api_key().is_none() => warnings.push(format!(
                "Reasoning provider '{}' has no API key configured",
                p.provider
            )),
            None => warnings.push("No reasoning provider configured".to_string()),
            _ => {}
        }
        match &providers.tts {
            Some(p) if p.resolve_api_key().is_none() => warnings.push(format!(
                "TTS provider '{}' has no API key configured",
                p.provider
            )),
            None => warnings.push("No TTS provider configured".to_string()),
            _ => {}
        }
        match &providers.stt {
            Some(p) if p.resolve_api_key().is_none() => warnings.push(format!(
                "STT provider '{}' has no API key configured",
                p.provider
            )),
            None => warnings.push("No STT provider configured".to_string()),
            _ => {}
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let calls = self.calls();
        if calls.max_concurrent == 0 {
            errors.push("calls.max_concurrent must be at least 1".to_string());
        }
        if calls.sweep_interval_ms == 0 {
            errors.push("calls.sweep_interval_ms must be > 0".to_string());
        }
        if calls.allowed_destinations.is_empty() {
            warnings.push("calls.allowed_destinations is empty: every destination is allowed".to_string());
        }
        if calls.callback_url.is_none() {
            warnings.push("calls.callback_url is not set: call events are not reported".to_string());
        }

        if let Err(e) = self.call_settings() {
            errors.push(e.to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Rusty Dial data: `~/.rusty_dial/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty_dial")
}

/// Expand a user-supplied path (`~/dial.json`, `$HOME/dial.json`).
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}
