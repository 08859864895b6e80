//! Response pipeline: reasoning text is chunked into sentences as it streams,
//! and each sentence is synthesized as soon as it is complete. Synthesis of
//! later sentences overlaps playout of earlier ones while audio is still
//! delivered strictly in sentence order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rusty_dial_core::config::PipelineConfig;
use rusty_dial_core::error::AdapterError;
use rusty_dial_core::types::TaggedChunk;
use rusty_dial_providers::{ReasoningBackend, ReasoningRequest, TtsAdapter, VoiceConfig};

use crate::arbiter::TurnTicket;
use crate::chunker::SentenceChunker;

/// What an agent turn should say.
#[derive(Debug)]
pub enum PipelineJob {
    /// Generate a reply to caller speech.
    Respond(ReasoningRequest),
    /// Speak fixed text (greetings, injected responses).
    Speak(String),
}

/// Output of one agent turn, in order. Every event carries the turn's
/// sequence number so the consumer can drop anything stale.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A sentence was handed to synthesis; its audio follows.
    Sentence { seq: u64, index: usize, text: String },
    Chunk(TaggedChunk),
    /// A transient failure was absorbed; some content was skipped.
    Degraded { seq: u64, error: AdapterError },
    /// All text generated and all audio delivered.
    Finished { seq: u64, text: String, chunks: usize },
    /// An adapter became unusable or retries ran out.
    Failed { seq: u64, error: AdapterError },
}

impl PipelineEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Sentence { seq, .. }
            | Self::Degraded { seq, .. }
            | Self::Finished { seq, .. }
            | Self::Failed { seq, .. } => *seq,
            Self::Chunk(chunk) => chunk.seq,
        }
    }
}

/// Fixed apology played before hanging up on a fatal adapter error.
/// Synthesized at most once per process.
pub struct FallbackAudio {
    text: String,
    audio: OnceCell<Arc<[Bytes]>>,
}

impl FallbackAudio {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: OnceCell::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_cached(&self) -> bool {
        self.audio.initialized()
    }

    pub async fn get(&self, tts: &dyn TtsAdapter, voice: &VoiceConfig) -> Result<Arc<[Bytes]>, AdapterError> {
        self.audio
            .get_or_try_init(|| async {
                let mut stream = tts.synthesize(&self.text, voice).await?;
                let mut chunks = Vec::new();
                while let Some(chunk) = stream.next().await {
                    chunks.push(chunk?);
                }
                info!(chunks = chunks.len(), "Cached fallback audio");
                Ok::<_, AdapterError>(Arc::from(chunks))
            })
            .await
            .cloned()
    }
}

struct Slot {
    index: usize,
    text: String,
    audio: mpsc::Receiver<Result<Bytes, AdapterError>>,
}

struct PipelineInner {
    reasoning: Arc<dyn ReasoningBackend>,
    tts: Arc<dyn TtsAdapter>,
    voice: VoiceConfig,
    config: PipelineConfig,
    fallback: Arc<FallbackAudio>,
}

#[derive(Clone)]
pub struct ResponsePipeline {
    inner: Arc<PipelineInner>,
}

impl ResponsePipeline {
    pub fn new(
        reasoning: Arc<dyn ReasoningBackend>,
        tts: Arc<dyn TtsAdapter>,
        voice: VoiceConfig,
        config: PipelineConfig,
        fallback: Arc<FallbackAudio>,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                reasoning,
                tts,
                voice,
                config,
                fallback,
            }),
        }
    }

    /// Run one agent turn in the background.
    ///
    /// Dropping the receiver or firing the ticket's token stops the turn:
    /// no further synthesis is requested and nothing more is delivered.
    pub fn start(&self, ticket: &TurnTicket, job: PipelineJob) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(self.inner.config.synthesis_buffer_chunks);
        let inner = self.inner.clone();
        let seq = ticket.seq;
        let cancel = ticket.cancel.clone();
        tokio::spawn(async move {
            run_turn(inner, seq, cancel, job, tx).await;
        });
        rx
    }

    pub fn fallback_text(&self) -> &str {
        self.inner.fallback.text()
    }

    pub async fn fallback_audio(&self) -> Result<Arc<[Bytes]>, AdapterError> {
        self.inner.fallback.get(self.inner.tts.as_ref(), &self.inner.voice).await
    }
}

async fn run_turn(
    inner: Arc<PipelineInner>,
    seq: u64,
    cancel: CancellationToken,
    job: PipelineJob,
    events: mpsc::Sender<PipelineEvent>,
) {
    let (slot_tx, mut slot_rx) = mpsc::unbounded_channel();
    let generator = tokio::spawn(generate(inner.clone(), seq, cancel.clone(), job, slot_tx, events.clone()));

    let mut chunks = 0;
    while let Some(slot) = slot_rx.recv().await {
        let Slot { index, text, mut audio } = slot;
        if events.send(PipelineEvent::Sentence { seq, index, text }).await.is_err() {
            debug!(seq, "Pipeline receiver dropped, stopping turn");
            cancel.cancel();
            return;
        }
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = audio.recv() => item,
            };
            match item {
                None => break,
                Some(Ok(data)) => {
                    chunks += 1;
                    let chunk = TaggedChunk { seq, index, data };
                    if events.send(PipelineEvent::Chunk(chunk)).await.is_err() {
                        debug!(seq, "Pipeline receiver dropped, stopping turn");
                        cancel.cancel();
                        return;
                    }
                }
                Some(Err(error)) if error.is_transient() => {
                    warn!(seq, index, %error, "Skipping rest of sentence after synthesis error");
                    let _ = events.send(PipelineEvent::Degraded { seq, error }).await;
                    break;
                }
                Some(Err(error)) => {
                    cancel.cancel();
                    let _ = events.send(PipelineEvent::Failed { seq, error }).await;
                    return;
                }
            }
        }
    }

    let outcome = match generator.await {
        Ok(Ok(text)) => PipelineEvent::Finished { seq, text, chunks },
        Ok(Err(error)) => PipelineEvent::Failed { seq, error },
        Err(e) => PipelineEvent::Failed {
            seq,
            error: AdapterError::fatal("pipeline", e),
        },
    };
    if cancel.is_cancelled() {
        return;
    }
    let _ = events.send(outcome).await;
}

/// Produce the turn's text and hand each completed sentence to synthesis.
async fn generate(
    inner: Arc<PipelineInner>,
    seq: u64,
    cancel: CancellationToken,
    job: PipelineJob,
    slots: mpsc::UnboundedSender<Slot>,
    events: mpsc::Sender<PipelineEvent>,
) -> Result<String, AdapterError> {
    let mut chunker = SentenceChunker::new(inner.config.max_chunk_chars);
    let mut index = 0;
    let mut schedule = |text: String| {
        if cancel.is_cancelled() {
            return;
        }
        let audio = spawn_synthesis(&inner, text.clone(), cancel.clone());
        let _ = slots.send(Slot { index, text, audio });
        index += 1;
    };

    let request = match job {
        PipelineJob::Speak(text) => {
            chunker.push(&text).into_iter().for_each(&mut schedule);
            chunker.finish().into_iter().for_each(&mut schedule);
            return Ok(text);
        }
        PipelineJob::Respond(request) => request,
    };

    // Retry until the first delta arrives; after that the caller may already
    // be hearing the answer, so a restart would repeat it.
    let reasoning = inner.reasoning.clone();
    let (first, mut stream) = retry(&inner.config, &cancel, |_| {
        let reasoning = reasoning.clone();
        let request = request.clone();
        async move {
            let mut stream = reasoning.generate(request).await?;
            match stream.next().await {
                Some(Ok(delta)) => Ok((Some(delta), stream)),
                Some(Err(e)) => Err(e),
                None => Ok((None, stream)),
            }
        }
    })
    .await?;

    let mut text = String::new();
    let mut pending = first;
    loop {
        let delta = match pending.take() {
            Some(delta) => delta,
            None => match stream.next().await {
                Some(Ok(delta)) => delta,
                Some(Err(error)) if error.is_transient() => {
                    warn!(seq, %error, "Reasoning stream broke mid-answer, keeping partial text");
                    let _ = events.send(PipelineEvent::Degraded { seq, error }).await;
                    break;
                }
                Some(Err(error)) => return Err(error),
                None => break,
            },
        };
        if cancel.is_cancelled() {
            break;
        }
        text.push_str(&delta);
        chunker.push(&delta).into_iter().for_each(&mut schedule);
    }
    chunker.finish().into_iter().for_each(&mut schedule);

    debug!(seq, chars = text.len(), sentences = index, "Generation finished");
    Ok(text.trim().to_string())
}

fn spawn_synthesis(
    inner: &Arc<PipelineInner>,
    text: String,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Bytes, AdapterError>> {
    let (tx, rx) = mpsc::channel(inner.config.synthesis_buffer_chunks);
    let inner = inner.clone();
    tokio::spawn(async move {
        let opened = retry(&inner.config, &cancel, |_| inner.tts.synthesize(&text, &inner.voice)).await;
        let mut audio = match opened {
            Ok(audio) => audio,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = audio.next() => item,
            };
            let Some(item) = item else { break };
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                debug!("Synthesis receiver dropped, stopping stream");
                break;
            }
            if failed {
                break;
            }
        }
    });
    rx
}

/// Run `op`, retrying transient failures with jittered exponential backoff.
async fn retry<T, F, Fut>(config: &PipelineConfig, cancel: &CancellationToken, mut op: F) -> Result<T, AdapterError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries && !cancel.is_cancelled() => {
                let delay = backoff(config.retry_backoff_ms, attempt);
                warn!(
                    adapter = e.adapter(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient adapter error, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base_ms / 4);
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{TurnArbiter, TurnGate};
    use async_trait::async_trait;
    use rusty_dial_core::isolation::wrap;
    use rusty_dial_core::types::CallId;
    use rusty_dial_providers::{AudioStream, TextStream};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted generation attempts.
    struct ScriptedReasoning {
        attempts: Mutex<VecDeque<Vec<Result<String, AdapterError>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedReasoning {
        fn new(attempts: Vec<Vec<Result<String, AdapterError>>>) -> Self {
            Self {
                attempts: Mutex::new(attempts.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReasoningBackend for ScriptedReasoning {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _request: ReasoningRequest) -> Result<TextStream, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items = self.attempts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Two chunks per sentence: "<text>#0", "<text>#1".
    struct EchoTts {
        fail_fatal: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TtsAdapter for EchoTts {
        fn id(&self) -> &str {
            "echo"
        }

        async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> Result<AudioStream, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_fatal {
                return Err(AdapterError::fatal("echo", "voice not found"));
            }
            let chunks: Vec<Result<Bytes, AdapterError>> = (0..2)
                .map(|i| Ok(Bytes::from(format!("{text}#{i}"))))
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn echo_tts() -> Arc<EchoTts> {
        Arc::new(EchoTts {
            fail_fatal: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn pipeline(reasoning: Arc<dyn ReasoningBackend>, tts: Arc<dyn TtsAdapter>) -> ResponsePipeline {
        let config = PipelineConfig {
            retry_backoff_ms: 10,
            ..PipelineConfig::default()
        };
        ResponsePipeline::new(
            reasoning,
            tts,
            VoiceConfig::default(),
            config,
            Arc::new(FallbackAudio::new("Sorry, something went wrong.")),
        )
    }

    fn ticket() -> TurnTicket {
        let mut arbiter = TurnArbiter::new(CallId::new(), TurnGate::default());
        arbiter.begin_agent_turn(0).unwrap()
    }

    fn request(cancel: &CancellationToken) -> ReasoningRequest {
        ReasoningRequest {
            call_id: CallId::new(),
            input: wrap("Kerro sää"),
            context: Vec::new(),
            call_context: String::new(),
            cancel: cancel.clone(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn audio(events: &[PipelineEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Chunk(c) => Some(String::from_utf8_lossy(&c.data).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sentences_play_in_order() {
        let reasoning = Arc::new(ScriptedReasoning::new(vec![vec![
            Ok("Tänään on ".into()),
            Ok("aurinkoista. Huomenna".into()),
            Ok(" sataa.".into()),
        ]]));
        let p = pipeline(reasoning, echo_tts());
        let t = ticket();
        let events = drain(p.start(&t, PipelineJob::Respond(request(&t.cancel)))).await;

        assert_eq!(
            audio(&events),
            [
                "Tänään on aurinkoista.#0",
                "Tänään on aurinkoista.#1",
                "Huomenna sataa.#0",
                "Huomenna sataa.#1"
            ]
        );
        assert!(events.iter().all(|e| e.seq() == t.seq));
        match events.last() {
            Some(PipelineEvent::Finished { text, chunks, .. }) => {
                assert_eq!(text, "Tänään on aurinkoista. Huomenna sataa.");
                assert_eq!(*chunks, 4);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_start_failure_is_retried() {
        let reasoning = Arc::new(ScriptedReasoning::new(vec![
            vec![Err(AdapterError::transient("scripted", "503"))],
            vec![Ok("Hei.".into())],
        ]));
        let p = pipeline(reasoning.clone(), echo_tts());
        let t = ticket();
        let events = drain(p.start(&t, PipelineJob::Respond(request(&t.cancel)))).await;

        assert_eq!(reasoning.calls.load(Ordering::SeqCst), 2);
        assert_eq!(audio(&events), ["Hei.#0", "Hei.#1"]);
        assert!(matches!(events.last(), Some(PipelineEvent::Finished { .. })));
    }

    #[tokio::test]
    async fn test_retries_run_out() {
        let reasoning = Arc::new(ScriptedReasoning::new(vec![
            vec![Err(AdapterError::transient("scripted", "503"))],
            vec![Err(AdapterError::transient("scripted", "503"))],
            vec![Err(AdapterError::transient("scripted", "503"))],
        ]));
        let p = pipeline(reasoning.clone(), echo_tts());
        let t = ticket();
        let events = drain(p.start(&t, PipelineJob::Respond(request(&t.cancel)))).await;

        assert_eq!(reasoning.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(events.last(), Some(PipelineEvent::Failed { error, .. }) if error.is_transient()));
    }

    #[tokio::test]
    async fn test_mid_stream_break_keeps_partial_answer() {
        let reasoning = Arc::new(ScriptedReasoning::new(vec![vec![
            Ok("First part.".into()),
            Err(AdapterError::transient("scripted", "connection reset")),
        ]]));
        let p = pipeline(reasoning.clone(), echo_tts());
        let t = ticket();
        let events = drain(p.start(&t, PipelineJob::Respond(request(&t.cancel)))).await;

        assert_eq!(reasoning.calls.load(Ordering::SeqCst), 1);
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::Degraded { .. })));
        assert_eq!(audio(&events), ["First part.#0", "First part.#1"]);
        assert!(matches!(events.last(), Some(PipelineEvent::Finished { text, .. }) if text == "First part."));
    }

    #[tokio::test]
    async fn test_fatal_synthesis_fails_turn() {
        let tts = Arc::new(EchoTts {
            fail_fatal: true,
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(Arc::new(ScriptedReasoning::new(Vec::new())), tts.clone());
        let t = ticket();
        let events = drain(p.start(&t, PipelineJob::Speak("Hello.".into()))).await;

        assert_eq!(tts.calls.load(Ordering::SeqCst), 1);
        assert!(audio(&events).is_empty());
        assert!(matches!(events.last(), Some(PipelineEvent::Failed { error, .. }) if !error.is_transient()));
    }

    #[tokio::test]
    async fn test_cancelled_turn_requests_no_synthesis() {
        let tts = echo_tts();
        let p = pipeline(Arc::new(ScriptedReasoning::new(Vec::new())), tts.clone());
        let t = ticket();
        t.cancel.cancel();
        let events = drain(p.start(&t, PipelineJob::Speak("One. Two. Three.".into()))).await;

        assert!(events.is_empty());
        assert_eq!(tts.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_synthesized_once() {
        let tts = echo_tts();
        let p = pipeline(Arc::new(ScriptedReasoning::new(Vec::new())), tts.clone());
        let first = p.fallback_audio().await.unwrap();
        let second = p.fallback_audio().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tts.calls.load(Ordering::SeqCst), 1);
    }
}
