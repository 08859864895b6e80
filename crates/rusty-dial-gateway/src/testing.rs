//! In-memory collaborators for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rusty_dial_core::config::CallSettings;
use rusty_dial_core::error::AdapterError;
use rusty_dial_core::types::{AudioFrame, CallId};
use rusty_dial_media::call::{CallHandle, CallOptions, CallRecord, Collaborators, spawn_call};
use rusty_dial_media::pipeline::FallbackAudio;
use rusty_dial_providers::{
    AudioStream, ReasoningBackend, ReasoningRequest, SttAdapter, SttSession, TextStream, TransportLink, TtsAdapter,
    VoiceConfig,
};

/// Hears audio but never transcribes anything.
pub struct SilentStt;

#[async_trait]
impl SttAdapter for SilentStt {
    fn id(&self) -> &str {
        "silent-stt"
    }

    async fn open(&self, _call_id: CallId) -> Result<SttSession, AdapterError> {
        let (frames, mut frames_rx) = mpsc::channel::<AudioFrame>(64);
        tokio::spawn(async move { while frames_rx.recv().await.is_some() {} });
        Ok(SttSession {
            frames,
            events: Box::pin(futures::stream::pending()),
        })
    }
}

pub struct FixedReasoning(pub &'static str);

#[async_trait]
impl ReasoningBackend for FixedReasoning {
    fn id(&self) -> &str {
        "fixed-llm"
    }

    async fn generate(&self, _request: ReasoningRequest) -> Result<TextStream, AdapterError> {
        Ok(Box::pin(futures::stream::iter(vec![Ok(self.0.to_string())])))
    }
}

/// Two 100 ms chunks of silence per sentence.
pub struct SilenceTts;

#[async_trait]
impl TtsAdapter for SilenceTts {
    fn id(&self) -> &str {
        "silence-tts"
    }

    async fn synthesize(&self, _text: &str, _voice: &VoiceConfig) -> Result<AudioStream, AdapterError> {
        let chunks: Vec<Result<Bytes, AdapterError>> = (0..2).map(|_| Ok(Bytes::from(vec![0u8; 3200]))).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

pub fn collaborators() -> Collaborators {
    Collaborators {
        reasoning: Arc::new(FixedReasoning("Selvä.")),
        stt: Arc::new(SilentStt),
        tts: Arc::new(SilenceTts),
        voice: VoiceConfig::default(),
        fallback: Arc::new(FallbackAudio::new("Anteeksi.")),
    }
}

/// A call whose transport never connects; it sits dialing until ended.
pub fn launch_pending(call_id: CallId, collaborators: &Collaborators) -> (CallHandle, JoinHandle<CallRecord>) {
    let options = CallOptions {
        call_id,
        settings: Arc::new(CallSettings::default()),
        call_context: String::new(),
        greeting: None,
    };
    spawn_call(
        options,
        collaborators.clone(),
        std::future::pending::<Result<TransportLink, AdapterError>>(),
    )
}

/// A local HTTP endpoint that forwards every JSON body POSTed to `/events`.
pub async fn capture_server() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route(
            "/events",
            post(
                |State(tx): State<mpsc::UnboundedSender<serde_json::Value>>, Json(body): Json<serde_json::Value>| async move {
                    let _ = tx.send(body);
                },
            ),
        )
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/events"), rx)
}
