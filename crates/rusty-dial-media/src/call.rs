//! Per-call runtime.
//!
//! Each call runs as one task that owns its segmenter, arbiter, history and
//! outbound queue. Inputs are multiplexed with a biased `select!` in priority
//! order: inbound audio (barge-in must never wait behind anything), control
//! commands, transcripts, pipeline output, playout reports, and finally the
//! segmenter's silence deadline.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rusty_dial_core::config::CallSettings;
use rusty_dial_core::error::{AdapterError, Result, RustyDialError};
use rusty_dial_core::history::{ContextTurn, ConversationHistory, ResponseSource};
use rusty_dial_core::isolation::{self, TaggedInput};
use rusty_dial_core::types::{
    AudioFrame, CallId, CallState, EndReason, TaggedChunk, TranscriptEvent, TransportEvent, Turn, TurnHolder,
};
use rusty_dial_core::utterance::Utterance;
use rusty_dial_providers::{
    AudioSink, ReasoningBackend, ReasoningRequest, SttAdapter, TransportLink, TtsAdapter, VoiceConfig,
};

use crate::arbiter::{Transition, TurnArbiter, TurnGate};
use crate::outbound::{OutboundQueue, PlayoutEvent};
use crate::pipeline::{FallbackAudio, PipelineEvent, PipelineJob, ResponsePipeline};
use crate::segmenter::Segmenter;
use crate::vad::BargeInDetector;

const COMMAND_BUFFER: usize = 16;

/// Upper bound on synthesizing and playing the fallback apology.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Adapter name used for transport failures; no fallback is attempted on a
/// broken transport.
pub const TRANSPORT_ADAPTER: &str = "transport";

/// External collaborators shared by every call.
#[derive(Clone)]
pub struct Collaborators {
    pub reasoning: Arc<dyn ReasoningBackend>,
    pub stt: Arc<dyn SttAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
    pub voice: VoiceConfig,
    pub fallback: Arc<FallbackAudio>,
}

/// Per-call parameters fixed when the call opens.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub call_id: CallId,
    pub settings: Arc<CallSettings>,
    /// Operator-supplied background passed to the reasoning backend.
    pub call_context: String,
    /// Spoken as soon as media connects.
    pub greeting: Option<String>,
}

#[derive(Debug)]
pub enum CallCommand {
    /// Speak fixed text as an agent turn.
    Speak(String),
    End(EndReason),
}

/// Latest observable state of a call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub turn: Turn,
    pub turn_count: u64,
    pub history: Arc<ConversationHistory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl CallSnapshot {
    fn initial() -> Self {
        Self {
            state: CallState::Idle,
            turn: Turn {
                holder: TurnHolder::None,
                acquired_at_ms: 0,
                seq: 0,
            },
            turn_count: 0,
            history: Arc::new(ConversationHistory::new()),
            end_reason: None,
        }
    }
}

/// Everything left of a call once it has ended.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub end_reason: EndReason,
    pub turn_count: u64,
    pub duration_ms: u64,
    pub history: Arc<ConversationHistory>,
    pub transitions: Vec<Transition>,
}

/// Cheap handle to a running call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    call_id: CallId,
    commands: mpsc::Sender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Speak `text` as the agent's next turn.
    pub async fn speak(&self, text: impl Into<String>) -> Result<()> {
        self.send(CallCommand::Speak(text.into())).await
    }

    /// Ask the call to end. The first reason wins.
    pub async fn end(&self, reason: EndReason) -> Result<()> {
        self.send(CallCommand::End(reason)).await
    }

    async fn send(&self, command: CallCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RustyDialError::CallEnded(self.call_id))
    }
}

/// Start a call. `connect` resolves to the call's transport (for outbound
/// calls, once the callee answers); the call can be ended before that.
pub fn spawn_call<F>(options: CallOptions, collaborators: Collaborators, connect: F) -> (CallHandle, JoinHandle<CallRecord>)
where
    F: Future<Output = std::result::Result<TransportLink, AdapterError>> + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::initial());
    let handle = CallHandle {
        call_id: options.call_id,
        commands: commands_tx,
        snapshot: snapshot_rx,
    };
    let task = tokio::spawn(drive(options, collaborators, connect, commands_rx, snapshot_tx));
    (handle, task)
}

async fn drive<F>(
    options: CallOptions,
    collaborators: Collaborators,
    connect: F,
    mut commands: mpsc::Receiver<CallCommand>,
    snapshot_tx: watch::Sender<CallSnapshot>,
) -> CallRecord
where
    F: Future<Output = std::result::Result<TransportLink, AdapterError>> + Send + 'static,
{
    let call_id = options.call_id;
    let opened = Instant::now();
    let mut early = Vec::new();

    tokio::pin!(connect);
    let link = loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(CallCommand::Speak(text)) => early.push(text),
                Some(CallCommand::End(reason)) => {
                    return unconnected(call_id, reason, opened, &snapshot_tx);
                }
                None => return unconnected(call_id, EndReason::Shutdown, opened, &snapshot_tx),
            },
            result = &mut connect => match result {
                Ok(link) => break link,
                Err(error) => {
                    warn!(%call_id, %error, "Call failed to connect");
                    return unconnected(call_id, fatal_reason(&error), opened, &snapshot_tx);
                }
            },
        }
    };

    let stt = match collaborators.stt.open(call_id).await {
        Ok(session) => session,
        Err(error) => {
            warn!(%call_id, %error, "Failed to open transcription session");
            let reason = fatal_reason(&error);
            if let Err(e) = link.sink.hangup(&reason).await {
                debug!(%call_id, error = %e, "Hangup after STT failure failed");
            }
            return unconnected(call_id, reason, opened, &snapshot_tx);
        }
    };

    info!(%call_id, "Call media connected");

    let settings = options.settings.clone();
    let gate = TurnGate::default();
    let writer_cancel = CancellationToken::new();
    let (outbound, playout, writer) = OutboundQueue::spawn(
        link.sink.clone(),
        gate.clone(),
        settings.pipeline.outbound_buffer_chunks,
        writer_cancel.clone(),
    );
    let pipeline = ResponsePipeline::new(
        collaborators.reasoning.clone(),
        collaborators.tts.clone(),
        collaborators.voice.clone(),
        settings.pipeline.clone(),
        collaborators.fallback.clone(),
    );

    let mut runtime = CallRuntime {
        call_id,
        stt_adapter: collaborators.stt.id().to_string(),
        call_context: options.call_context,
        clock: Instant::now(),
        arbiter: TurnArbiter::new(call_id, gate),
        segmenter: Segmenter::new(settings.turn_taking.clone()),
        barge_in: BargeInDetector::new(&settings.barge_in),
        history: ConversationHistory::new(),
        history_dirty: false,
        pending: VecDeque::new(),
        active: None,
        outbound,
        playout,
        writer: Some(writer),
        writer_cancel,
        sink: link.sink,
        stt_frames: Some(stt.frames),
        pipeline,
        snapshot_tx,
        settings,
    };

    if let Some(greeting) = options.greeting.filter(|g| !g.trim().is_empty()) {
        runtime.pending.push_back(TurnRequest::Speak {
            text: greeting,
            source: ResponseSource::Greeting,
        });
    }
    for text in early {
        runtime.pending.push_back(TurnRequest::Speak {
            text,
            source: ResponseSource::Injected,
        });
    }
    runtime.try_start_next(0);
    runtime.publish();

    let record = runtime.run(link.events, stt.events, commands).await;
    info!(%call_id, reason = %record.end_reason, turns = record.turn_count, "Call finished");
    record
}

fn fatal_reason(error: &AdapterError) -> EndReason {
    EndReason::AdapterFatal {
        adapter: error.adapter().to_string(),
        message: error.to_string(),
    }
}

fn unconnected(
    call_id: CallId,
    reason: EndReason,
    opened: Instant,
    snapshot_tx: &watch::Sender<CallSnapshot>,
) -> CallRecord {
    let mut history = ConversationHistory::new();
    history.push_system("not_connected", json!({ "reason": reason.code() }), 0);
    let history = Arc::new(history);
    snapshot_tx.send_modify(|snap| {
        snap.state = CallState::Ended;
        snap.end_reason = Some(reason.clone());
        snap.history = history.clone();
    });
    CallRecord {
        call_id,
        end_reason: reason,
        turn_count: 0,
        duration_ms: opened.elapsed().as_millis() as u64,
        history,
        transitions: Vec::new(),
    }
}

enum TurnRequest {
    Answer { input: TaggedInput },
    Speak { text: String, source: ResponseSource },
}

struct ActiveTurn {
    seq: u64,
    /// None once the pipeline finished and only playout remains.
    events: Option<mpsc::Receiver<PipelineEvent>>,
    source: ResponseSource,
    /// Sentences already handed to synthesis.
    spoken: Vec<String>,
    /// Full response text, known once generation finished.
    text: Option<String>,
    chunks: usize,
}

struct CallRuntime {
    call_id: CallId,
    settings: Arc<CallSettings>,
    stt_adapter: String,
    call_context: String,
    clock: Instant,
    arbiter: TurnArbiter,
    segmenter: Segmenter,
    barge_in: BargeInDetector,
    history: ConversationHistory,
    history_dirty: bool,
    pending: VecDeque<TurnRequest>,
    active: Option<ActiveTurn>,
    outbound: OutboundQueue,
    playout: mpsc::UnboundedReceiver<PlayoutEvent>,
    writer: Option<JoinHandle<()>>,
    writer_cancel: CancellationToken,
    sink: Arc<dyn AudioSink>,
    stt_frames: Option<mpsc::Sender<AudioFrame>>,
    pipeline: ResponsePipeline,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl CallRuntime {
    async fn run(
        mut self,
        mut transport: mpsc::Receiver<TransportEvent>,
        mut transcripts: rusty_dial_providers::TranscriptStream,
        mut commands: mpsc::Receiver<CallCommand>,
    ) -> CallRecord {
        let mut stt_open = true;
        let mut playout_open = true;

        while !self.arbiter.is_ended() {
            let deadline = self
                .segmenter
                .deadline()
                .map(|ms| self.clock + Duration::from_millis(ms));
            let pipeline_ready = self.active.as_ref().is_some_and(|t| t.events.is_some()) && self.outbound.has_capacity();

            tokio::select! {
                biased;
                event = transport.recv() => match event {
                    Some(TransportEvent::Audio(frame)) => self.on_audio(frame),
                    Some(TransportEvent::Hangup) | None => self.end(EndReason::CallerHangup),
                },
                command = commands.recv() => match command {
                    Some(CallCommand::Speak(text)) => self.enqueue(TurnRequest::Speak {
                        text,
                        source: ResponseSource::Injected,
                    }),
                    Some(CallCommand::End(reason)) => self.end(reason),
                    None => self.end(EndReason::Shutdown),
                },
                item = transcripts.next(), if stt_open => match item {
                    Some(Ok(event)) => self.on_transcript(event),
                    Some(Err(error)) => self.on_stt_error(error),
                    None => {
                        stt_open = false;
                        self.on_stt_error(AdapterError::fatal(self.stt_adapter.clone(), "transcription session closed"));
                    }
                },
                event = next_pipeline_event(&mut self.active), if pipeline_ready => self.on_pipeline(event),
                event = self.playout.recv(), if playout_open => match event {
                    Some(PlayoutEvent::Drained(seq)) => self.on_drained(seq),
                    Some(PlayoutEvent::Failed(error)) => {
                        self.end(EndReason::AdapterFatal {
                            adapter: TRANSPORT_ADAPTER.into(),
                            message: error.to_string(),
                        });
                    }
                    None => playout_open = false,
                },
                _ = sleep_until_opt(deadline) => self.on_deadline(),
            }
            self.publish();
        }

        self.finish().await
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn on_audio(&mut self, frame: AudioFrame) {
        if self.barge_in.observe(&frame) {
            let now = self.now_ms();
            match self.arbiter.state() {
                CallState::Thinking | CallState::Speaking if self.settings.barge_in.enabled => self.interrupt(now),
                CallState::Idle | CallState::Interrupted => {
                    let _ = self.arbiter.caller_activity(now);
                }
                _ => {}
            }
        }

        if let Some(frames) = &self.stt_frames {
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(call_id = %self.call_id, "Transcription backlog full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => self.stt_frames = None,
            }
        }
    }

    fn interrupt(&mut self, now: u64) {
        let Some(stale) = self.arbiter.barge_in(now) else {
            return;
        };
        let dropped = self.outbound.interrupt();
        if let Some(turn) = self.active.take() {
            self.abandon(turn, now);
        }
        self.history.push_system(
            "barge_in",
            json!({ "stale_seq": stale, "dropped_chunks": dropped }),
            now,
        );
        self.history_dirty = true;
    }

    fn on_transcript(&mut self, mut event: TranscriptEvent) {
        if event.text.trim().is_empty() {
            return;
        }
        // Adapters stamp events with their own clocks; the call clock is the
        // only one the segmenter sees.
        let now = self.now_ms();
        event.timestamp_ms = now;

        let state = self.arbiter.state();
        let interrupting = matches!(state, CallState::Thinking | CallState::Speaking | CallState::Interrupted);
        if matches!(state, CallState::Idle | CallState::Interrupted) {
            let _ = self.arbiter.caller_activity(now);
        }
        if let Some(utterance) = self.segmenter.push(&event, interrupting) {
            self.on_utterance(utterance, now);
        }
    }

    fn on_stt_error(&mut self, error: AdapterError) {
        let now = self.now_ms();
        warn!(call_id = %self.call_id, %error, "Transcription failed");
        if let Some(utterance) = self.segmenter.fail(now) {
            self.on_utterance(utterance, now);
        }
        if error.is_transient() {
            self.history.push_system(
                "adapter_transient",
                json!({ "adapter": error.adapter(), "message": error.to_string() }),
                now,
            );
            self.history_dirty = true;
        } else {
            self.end(fatal_reason(&error));
        }
    }

    fn on_deadline(&mut self) {
        let now = self.now_ms();
        if let Some(utterance) = self.segmenter.poll(now) {
            self.on_utterance(utterance, now);
        }
        self.try_start_next(now);
    }

    fn on_utterance(&mut self, utterance: Utterance, now: u64) {
        if utterance.is_empty() {
            return;
        }
        let input = isolation::wrap(utterance.text());
        if input.is_suspicious() {
            warn!(
                call_id = %self.call_id,
                utterance_id = utterance.id(),
                score = input.score(),
                flags = ?input.flags(),
                "Caller speech matched prompt-injection patterns"
            );
        }
        info!(
            call_id = %self.call_id,
            utterance_id = utterance.id(),
            reason = ?utterance.reason(),
            degraded = utterance.is_degraded(),
            "Caller utterance"
        );
        self.history.push_caller(Arc::new(utterance), input.clone(), now);
        self.history_dirty = true;
        self.enqueue(TurnRequest::Answer { input });
    }

    fn enqueue(&mut self, request: TurnRequest) {
        self.pending.push_back(request);
        let now = self.now_ms();
        self.try_start_next(now);
    }

    /// Give the floor to the agent for the next pending request, if the
    /// floor is free and the caller is not mid-utterance.
    fn try_start_next(&mut self, now: u64) {
        if self.active.is_some() || self.segmenter.has_open_span() {
            return;
        }
        if !matches!(
            self.arbiter.state(),
            CallState::Idle | CallState::Listening | CallState::Interrupted
        ) {
            return;
        }
        let Some(request) = self.pending.pop_front() else {
            return;
        };
        let ticket = match self.arbiter.begin_agent_turn(now) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Could not start agent turn");
                return;
            }
        };
        self.barge_in.reset();

        let (job, source) = match request {
            TurnRequest::Answer { input } => {
                let context = self.context_for(&input);
                let request = ReasoningRequest {
                    call_id: self.call_id,
                    input,
                    context,
                    call_context: self.call_context.clone(),
                    cancel: ticket.cancel.clone(),
                };
                (PipelineJob::Respond(request), ResponseSource::Generated)
            }
            TurnRequest::Speak { text, source } => (PipelineJob::Speak(text), source),
        };
        debug!(call_id = %self.call_id, seq = ticket.seq, ?source, "Agent turn started");
        let events = self.pipeline.start(&ticket, job);
        self.active = Some(ActiveTurn {
            seq: ticket.seq,
            events: Some(events),
            source,
            spoken: Vec::new(),
            text: None,
            chunks: 0,
        });
    }

    /// Prior exchanges for a reasoning request, excluding `input` itself.
    fn context_for(&self, input: &TaggedInput) -> Vec<ContextTurn> {
        let max_turns = self.settings.history_turns;
        let mut context = self.history.reasoning_context(max_turns + 1);
        if matches!(context.last(), Some(ContextTurn::Caller(last)) if last == input) {
            context.pop();
        }
        if context.len() > max_turns {
            context.drain(..context.len() - max_turns);
        }
        context
    }

    fn on_pipeline(&mut self, event: Option<PipelineEvent>) {
        let now = self.now_ms();
        let Some(event) = event else {
            // The pipeline stopped without a result; treat it as done.
            if let Some(turn) = self.active.as_mut() {
                turn.events = None;
            }
            self.complete_generation(String::new(), now);
            return;
        };

        let seq = event.seq();
        let current = self.active.as_ref().is_some_and(|t| t.seq == seq) && self.arbiter.is_current(seq);
        if !current {
            debug!(call_id = %self.call_id, seq, "Discarding stale pipeline output");
            return;
        }

        match event {
            PipelineEvent::Sentence { text, .. } => {
                if let Some(turn) = self.active.as_mut() {
                    turn.spoken.push(text);
                }
            }
            PipelineEvent::Chunk(chunk) => self.play(chunk, now),
            PipelineEvent::Degraded { error, .. } => {
                self.history.push_system(
                    "adapter_transient",
                    json!({ "adapter": error.adapter(), "message": error.to_string() }),
                    now,
                );
                self.history_dirty = true;
            }
            PipelineEvent::Finished { text, .. } => {
                if let Some(turn) = self.active.as_mut() {
                    turn.events = None;
                }
                self.complete_generation(text, now);
            }
            PipelineEvent::Failed { error, .. } => {
                warn!(call_id = %self.call_id, %error, "Response pipeline failed");
                self.end(fatal_reason(&error));
            }
        }
    }

    fn play(&mut self, chunk: TaggedChunk, now: u64) {
        let seq = chunk.seq;
        if self.arbiter.state() == CallState::Thinking {
            let _ = self.arbiter.first_audio(seq, now);
        }
        match self.outbound.push(chunk) {
            Ok(()) => {
                if let Some(turn) = self.active.as_mut() {
                    turn.chunks += 1;
                }
            }
            Err(chunk) => {
                warn!(call_id = %self.call_id, seq, index = chunk.index, "Outbound queue full, dropping chunk");
            }
        }
    }

    /// All text for the active turn is known. Wait for the audio to drain
    /// before recording it, or release the floor right away if nothing was
    /// played.
    fn complete_generation(&mut self, text: String, now: u64) {
        let Some(turn) = self.active.as_mut() else {
            return;
        };
        let text = if text.is_empty() { turn.spoken.join(" ") } else { text };
        if turn.chunks > 0 {
            turn.text = Some(text);
            self.outbound.end_of_turn(turn.seq);
            return;
        }
        let (seq, source) = (turn.seq, turn.source);
        self.active = None;
        self.record_agent(source, text, seq, false, now);
        let _ = self.arbiter.agent_finished(seq, now);
        self.try_start_next(now);
    }

    fn on_drained(&mut self, seq: u64) {
        if !self.active.as_ref().is_some_and(|t| t.seq == seq && t.events.is_none()) {
            return;
        }
        let now = self.now_ms();
        if let Some(turn) = self.active.take() {
            self.record_agent(turn.source, turn.text.unwrap_or_default(), seq, false, now);
        }
        if self.arbiter.agent_finished(seq, now).is_ok() {
            self.try_start_next(now);
        }
    }

    fn record_agent(&mut self, source: ResponseSource, text: String, seq: u64, interrupted: bool, now: u64) {
        if text.is_empty() && interrupted {
            return;
        }
        self.history.push_agent(text, seq, source, interrupted, now);
        self.history_dirty = true;
    }

    /// Record what was said of a turn cut short.
    fn abandon(&mut self, turn: ActiveTurn, now: u64) {
        let text = match turn.text {
            Some(text) if turn.spoken.is_empty() => text,
            _ => turn.spoken.join(" "),
        };
        self.record_agent(turn.source, text, turn.seq, true, now);
    }

    fn end(&mut self, reason: EndReason) {
        let now = self.now_ms();
        let hangup = reason == EndReason::CallerHangup;
        let agent_had_floor = self.arbiter.state().holder() == TurnHolder::Agent;
        if !self.arbiter.end(reason.clone(), now) {
            return;
        }
        info!(call_id = %self.call_id, %reason, "Call ending");
        let seq = self.arbiter.seq();
        if let Some(turn) = self.active.take() {
            self.abandon(turn, now);
        }
        if agent_had_floor && !hangup {
            self.outbound.interrupt();
        }
        self.history.push_system("call_ended", json!({ "reason": reason.code(), "seq": seq }), now);
        self.history_dirty = true;
    }

    async fn finish(mut self) -> CallRecord {
        let now = self.now_ms();
        if let Some(utterance) = self.segmenter.flush(now) {
            if !utterance.is_empty() {
                let input = isolation::wrap(utterance.text());
                self.history.push_caller(Arc::new(utterance), input, now);
                self.history_dirty = true;
            }
        }
        self.stt_frames = None;

        let reason = self
            .arbiter
            .end_reason()
            .cloned()
            .unwrap_or(EndReason::Shutdown);
        let transport_gone = match &reason {
            EndReason::CallerHangup => true,
            EndReason::AdapterFatal { adapter, .. } => adapter == TRANSPORT_ADAPTER,
            _ => false,
        };
        if !transport_gone && matches!(reason, EndReason::AdapterFatal { .. }) {
            self.play_fallback().await;
        }

        // Let the writer flush pending clears before the transport goes away.
        self.outbound.close();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
                debug!(call_id = %self.call_id, "Outbound writer did not drain in time");
            }
        }
        self.writer_cancel.cancel();

        if !transport_gone {
            if let Err(e) = self.sink.hangup(&reason).await {
                debug!(call_id = %self.call_id, error = %e, "Transport hangup failed");
            }
        }
        self.publish();

        CallRecord {
            call_id: self.call_id,
            end_reason: reason,
            turn_count: self.arbiter.agent_turns(),
            duration_ms: self.now_ms(),
            history: Arc::new(self.history),
            transitions: self.arbiter.transitions().to_vec(),
        }
    }

    /// Speak the predefined apology before hanging up. Never generated, so
    /// an unusable reasoning backend cannot block it.
    async fn play_fallback(&mut self) {
        let seq = self.arbiter.seq();
        let played = tokio::time::timeout(FALLBACK_TIMEOUT, async {
            let audio = self.pipeline.fallback_audio().await?;
            for data in audio.iter() {
                let mut chunk = TaggedChunk {
                    seq,
                    index: 0,
                    data: data.clone(),
                };
                loop {
                    match self.outbound.push(chunk) {
                        Ok(()) => break,
                        Err(returned) => {
                            chunk = returned;
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                    }
                }
            }
            self.outbound.end_of_turn(seq);
            // Only a drain of this turn proves the caller heard it.
            let drained: std::result::Result<(), AdapterError> = loop {
                match self.playout.recv().await {
                    Some(PlayoutEvent::Drained(drained)) if drained == seq => break Ok(()),
                    Some(PlayoutEvent::Drained(_)) => {}
                    Some(PlayoutEvent::Failed(error)) => break Err(error),
                    None => {
                        break Err(AdapterError::fatal(
                            TRANSPORT_ADAPTER,
                            "playout stopped before the fallback finished",
                        ));
                    }
                }
            };
            drained
        })
        .await;

        let now = self.now_ms();
        let reason = match played {
            Ok(Ok(())) => {
                let text = self.pipeline.fallback_text().to_string();
                self.history.push_agent(text, seq, ResponseSource::Fallback, false, now);
                self.history_dirty = true;
                return;
            }
            Ok(Err(error)) => {
                warn!(call_id = %self.call_id, %error, "Fallback audio not delivered");
                error.to_string()
            }
            Err(_) => {
                warn!(call_id = %self.call_id, "Fallback audio timed out");
                "timed out".to_string()
            }
        };
        self.history
            .push_system("fallback_undelivered", json!({ "seq": seq, "reason": reason }), now);
        self.history_dirty = true;
    }

    fn publish(&mut self) {
        let state = self.arbiter.state();
        let turn = self.arbiter.turn();
        let turn_count = self.arbiter.agent_turns();
        let end_reason = self.arbiter.end_reason().cloned();
        let history = if self.history_dirty {
            self.history_dirty = false;
            Some(Arc::new(self.history.clone()))
        } else {
            None
        };
        self.snapshot_tx.send_if_modified(|snap| {
            let mut changed = false;
            if snap.state != state || snap.turn != turn || snap.turn_count != turn_count || snap.end_reason != end_reason {
                snap.state = state;
                snap.turn = turn;
                snap.turn_count = turn_count;
                snap.end_reason = end_reason;
                changed = true;
            }
            if let Some(history) = history {
                snap.history = history;
                changed = true;
            }
            changed
        });
    }
}

async fn next_pipeline_event(active: &mut Option<ActiveTurn>) -> Option<PipelineEvent> {
    match active.as_mut().and_then(|t| t.events.as_mut()) {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
