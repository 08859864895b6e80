//! End-to-end call scenarios against in-memory adapters, on a paused clock.
//!
//! Run with: `cargo test -p rusty-dial-media --test call_runtime`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use rusty_dial_core::config::CallSettings;
use rusty_dial_core::error::AdapterError;
use rusty_dial_core::history::{HistoryEntry, ResponseSource};
use rusty_dial_core::isolation::has_untrusted_marker;
use rusty_dial_core::types::{AudioFrame, CallId, CallState, EndReason, TaggedChunk, TranscriptEvent, TransportEvent};
use rusty_dial_core::utterance::DEGRADED_CONFIDENCE;
use rusty_dial_media::call::{CallHandle, CallOptions, CallRecord, CallSnapshot, Collaborators, spawn_call};
use rusty_dial_media::pipeline::FallbackAudio;
use rusty_dial_providers::{
    AudioSink, AudioStream, ReasoningBackend, ReasoningRequest, SttAdapter, SttSession, TextStream, TransportLink,
    TtsAdapter, VoiceConfig,
};

type TranscriptTx = mpsc::UnboundedSender<Result<TranscriptEvent, AdapterError>>;

struct ScriptedStt {
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<TranscriptEvent, AdapterError>>>>,
}

#[async_trait]
impl SttAdapter for ScriptedStt {
    fn id(&self) -> &str {
        "scripted-stt"
    }

    async fn open(&self, _call_id: CallId) -> Result<SttSession, AdapterError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AdapterError::fatal("scripted-stt", "already open"))?;
        let (frames, mut frames_rx) = mpsc::channel::<AudioFrame>(256);
        tokio::spawn(async move { while frames_rx.recv().await.is_some() {} });
        Ok(SttSession {
            frames,
            events: Box::pin(UnboundedReceiverStream::new(events)),
        })
    }
}

struct StubReasoning {
    reply: String,
    fail: Option<AdapterError>,
    requests: Mutex<Vec<ReasoningRequest>>,
}

impl StubReasoning {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            fail: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing(error: AdapterError) -> Arc<Self> {
        Arc::new(Self {
            reply: String::new(),
            fail: Some(error),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReasoningBackend for StubReasoning {
    fn id(&self) -> &str {
        "stub-llm"
    }

    async fn generate(&self, request: ReasoningRequest) -> Result<TextStream, AdapterError> {
        self.requests.lock().unwrap().push(request);
        if let Some(error) = &self.fail {
            return Err(error.clone());
        }
        let deltas: Vec<Result<String, AdapterError>> = self
            .reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// Every sentence becomes `chunks` chunks of 100 ms silence.
struct StubTts {
    chunks: usize,
}

#[async_trait]
impl TtsAdapter for StubTts {
    fn id(&self) -> &str {
        "stub-tts"
    }

    async fn synthesize(&self, _text: &str, _voice: &VoiceConfig) -> Result<AudioStream, AdapterError> {
        let chunks: Vec<Result<Bytes, AdapterError>> =
            (0..self.chunks).map(|_| Ok(Bytes::from(vec![0u8; 3200]))).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SinkEvent {
    Audio { seq: u64 },
    Clear,
    Hangup(String),
}

#[derive(Default)]
struct RecordingSink {
    log: Mutex<Vec<SinkEvent>>,
    /// Refuse every audio chunk, as a transport that went away would.
    reject_audio: bool,
}

impl RecordingSink {
    fn log(&self) -> Vec<SinkEvent> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn send_audio(&self, chunk: TaggedChunk) -> Result<(), AdapterError> {
        if self.reject_audio {
            return Err(AdapterError::fatal("recording-sink", "socket gone"));
        }
        self.log.lock().unwrap().push(SinkEvent::Audio { seq: chunk.seq });
        Ok(())
    }

    async fn clear(&self) -> Result<(), AdapterError> {
        self.log.lock().unwrap().push(SinkEvent::Clear);
        Ok(())
    }

    async fn hangup(&self, reason: &EndReason) -> Result<(), AdapterError> {
        self.log.lock().unwrap().push(SinkEvent::Hangup(reason.code().into()));
        Ok(())
    }
}

struct Harness {
    handle: CallHandle,
    task: JoinHandle<CallRecord>,
    transcripts: TranscriptTx,
    transport: mpsc::Sender<TransportEvent>,
    sink: Arc<RecordingSink>,
}

fn start_call(reasoning: Arc<StubReasoning>, settings: CallSettings, greeting: Option<&str>, chunks: usize) -> Harness {
    start_call_with_sink(reasoning, settings, greeting, chunks, Arc::new(RecordingSink::default()))
}

fn start_call_with_sink(
    reasoning: Arc<StubReasoning>,
    settings: CallSettings,
    greeting: Option<&str>,
    chunks: usize,
    sink: Arc<RecordingSink>,
) -> Harness {
    let (transcripts, transcript_rx) = mpsc::unbounded_channel();
    let (transport, transport_rx) = mpsc::channel(64);
    let link = TransportLink {
        events: transport_rx,
        sink: sink.clone(),
    };
    let collaborators = Collaborators {
        reasoning,
        stt: Arc::new(ScriptedStt {
            events: Mutex::new(Some(transcript_rx)),
        }),
        tts: Arc::new(StubTts { chunks }),
        voice: VoiceConfig::default(),
        fallback: Arc::new(FallbackAudio::new("Sorry, I have to hang up now.")),
    };
    let options = CallOptions {
        call_id: CallId::new(),
        settings: Arc::new(settings),
        call_context: String::new(),
        greeting: greeting.map(String::from),
    };
    let (handle, task) = spawn_call(options, collaborators, async move { Ok(link) });
    Harness {
        handle,
        task,
        transcripts,
        transport,
        sink,
    }
}

fn final_transcript(text: &str) -> Result<TranscriptEvent, AdapterError> {
    Ok(TranscriptEvent {
        text: text.into(),
        is_final: true,
        confidence: 0.92,
        timestamp_ms: 0,
        language: Some("fi".into()),
    })
}

fn interim_transcript(text: &str) -> Result<TranscriptEvent, AdapterError> {
    Ok(TranscriptEvent {
        text: text.into(),
        is_final: false,
        confidence: 0.8,
        timestamp_ms: 0,
        language: Some("fi".into()),
    })
}

fn system_events(record: &CallRecord) -> Vec<String> {
    record
        .history
        .entries()
        .iter()
        .filter_map(|e| match e {
            HistoryEntry::System { event, .. } => Some(event.clone()),
            _ => None,
        })
        .collect()
}

fn loud_frame() -> TransportEvent {
    TransportEvent::Audio(AudioFrame {
        samples: vec![3000; 320],
        timestamp_ms: 0,
    })
}

async fn wait_until(handle: &CallHandle, what: impl Fn(&CallSnapshot) -> bool) {
    let mut rx = handle.watch();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| what(s)))
        .await
        .expect("timed out waiting for call state")
        .expect("call task dropped its snapshot");
}

async fn finish(harness: Harness, reason: EndReason) -> (CallRecord, Vec<SinkEvent>) {
    let _ = harness.handle.end(reason).await;
    let record = harness.task.await.unwrap();
    (record, harness.sink.log())
}

fn agent_entries(record: &CallRecord) -> Vec<(String, ResponseSource, bool)> {
    record
        .history
        .entries()
        .iter()
        .filter_map(|e| match e {
            HistoryEntry::Agent {
                text,
                source,
                interrupted,
                ..
            } => Some((text.clone(), *source, *interrupted)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_question_answered_after_silence_wait() {
    let reasoning = StubReasoning::replying("Tänään on aurinkoista.");
    let h = start_call(reasoning.clone(), CallSettings::default(), None, 5);

    h.transcripts.send(final_transcript("Kerro sää")).unwrap();
    wait_until(&h.handle, |s| s.turn_count == 1 && s.state == CallState::Idle).await;

    let (record, log) = finish(h, EndReason::Requested { reason: "done".into() }).await;

    let path: Vec<(CallState, u64)> = record.transitions.iter().map(|t| (t.to, t.at_ms)).collect();
    assert_eq!(path[0], (CallState::Listening, 0));
    // No punctuation: the utterance closes after the long silence wait.
    assert_eq!(path[1], (CallState::Thinking, 1200));
    assert_eq!(path[2].0, CallState::Speaking);
    assert_eq!(path[3].0, CallState::Idle);
    // Idle only once the 500 ms of audio has played out.
    assert!(path[3].1 >= 1700, "went idle at {}", path[3].1);
    assert_eq!(path.last().map(|p| p.0), Some(CallState::Ended));

    let requests = reasoning.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let rendered = requests[0].input.render();
    assert!(rendered.contains("Kerro sää"));
    assert!(has_untrusted_marker(&rendered));

    assert_eq!(
        agent_entries(&record),
        [("Tänään on aurinkoista.".to_string(), ResponseSource::Generated, false)]
    );
    let audio = log.iter().filter(|e| matches!(e, SinkEvent::Audio { .. })).count();
    assert_eq!(audio, 5);
    assert_eq!(log.last(), Some(&SinkEvent::Hangup("requested".into())));
    assert_eq!(record.end_reason, EndReason::Requested { reason: "done".into() });
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_stops_agent_audio() {
    let reasoning = StubReasoning::replying("First sentence here. Second sentence here. Third sentence here.");
    let h = start_call(reasoning, CallSettings::default(), None, 10);

    h.transcripts.send(final_transcript("Tell me a story")).unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Speaking).await;
    let stale_seq = h.handle.snapshot().turn.seq;

    h.transport.send(loud_frame()).await.unwrap();
    h.transport.send(loud_frame()).await.unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Interrupted).await;
    assert!(h.handle.snapshot().turn.seq > stale_seq);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (record, log) = finish(h, EndReason::Requested { reason: "done".into() }).await;

    let clear_at = log.iter().position(|e| *e == SinkEvent::Clear).expect("transport was not cleared");
    assert!(
        log[clear_at..]
            .iter()
            .all(|e| !matches!(e, SinkEvent::Audio { seq } if *seq == stale_seq)),
        "stale audio reached the transport after barge-in: {log:?}"
    );
    let played = log[..clear_at].iter().filter(|e| matches!(e, SinkEvent::Audio { .. })).count();
    assert!(played < 30);

    let agent = agent_entries(&record);
    assert_eq!(agent.len(), 1);
    assert!(agent[0].2, "agent turn should be marked interrupted");
    assert!(record.history.entries().iter().any(|e| matches!(
        e,
        HistoryEntry::System { event, .. } if event == "barge_in"
    )));
    assert!(record.transitions.iter().any(|t| t.to == CallState::Interrupted));
}

#[tokio::test(start_paused = true)]
async fn test_caller_speaks_again_after_barge_in() {
    let reasoning = StubReasoning::replying("First sentence here. Second sentence here. Third sentence here.");
    let h = start_call(reasoning.clone(), CallSettings::default(), None, 10);

    h.transcripts.send(final_transcript("Tell me a story")).unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Speaking).await;
    let stale_seq = h.handle.snapshot().turn.seq;
    h.transport.send(loud_frame()).await.unwrap();
    h.transport.send(loud_frame()).await.unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Interrupted).await;

    h.transcripts.send(final_transcript("Actually, what time is it?")).unwrap();
    wait_until(&h.handle, |s| s.turn_count == 2 && s.state == CallState::Speaking).await;
    let answer_seq = h.handle.snapshot().turn.seq;
    assert!(answer_seq > stale_seq);
    wait_until(&h.handle, |s| s.turn_count == 2 && s.state == CallState::Idle).await;

    let (record, log) = finish(h, EndReason::Requested { reason: "done".into() }).await;

    let requests = reasoning.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].input.render().contains("Actually, what time is it?"));

    let interrupted_at = record
        .transitions
        .iter()
        .position(|t| t.to == CallState::Interrupted)
        .unwrap();
    let after: Vec<CallState> = record.transitions[interrupted_at + 1..].iter().map(|t| t.to).collect();
    assert_eq!(
        after,
        [CallState::Listening, CallState::Thinking, CallState::Speaking, CallState::Idle, CallState::Ended]
    );

    // The new answer plays in full after the clear.
    let clear_at = log.iter().position(|e| *e == SinkEvent::Clear).unwrap();
    let answer_audio = log[clear_at..]
        .iter()
        .filter(|e| matches!(e, SinkEvent::Audio { seq } if *seq == answer_seq))
        .count();
    assert_eq!(answer_audio, 30);

    let agent = agent_entries(&record);
    assert_eq!(agent.len(), 2);
    assert!(agent[0].2);
    assert_eq!(
        agent[1],
        (
            "First sentence here. Second sentence here. Third sentence here.".to_string(),
            ResponseSource::Generated,
            false
        )
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_stt_error_answers_degraded_utterance() {
    let reasoning = StubReasoning::replying("Selvä, varaan ajan.");
    let h = start_call(reasoning.clone(), CallSettings::default(), None, 2);

    h.transcripts.send(interim_transcript("Haluaisin varata ajan")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.transcripts
        .send(Err(AdapterError::transient("scripted-stt", "connection reset")))
        .unwrap();
    wait_until(&h.handle, |s| s.turn_count == 1 && s.state == CallState::Idle).await;

    // The session survives a transient error.
    h.transcripts.send(final_transcript("Kiitos.")).unwrap();
    wait_until(&h.handle, |s| s.turn_count == 2 && s.state == CallState::Idle).await;
    let (record, _) = finish(h, EndReason::Requested { reason: "done".into() }).await;

    let utterances: Vec<_> = record
        .history
        .entries()
        .iter()
        .filter_map(|e| match e {
            HistoryEntry::Caller { utterance, .. } => Some(utterance.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(utterances.len(), 2);
    assert_eq!(utterances[0].text(), "Haluaisin varata ajan");
    assert!(utterances[0].is_degraded());
    assert!(utterances[0].confidence() <= DEGRADED_CONFIDENCE);
    assert!(!utterances[1].is_degraded());

    assert!(system_events(&record).contains(&"adapter_transient".to_string()));
    let requests = reasoning.requests.lock().unwrap();
    assert!(requests[0].input.render().contains("Haluaisin varata ajan"));
    assert_eq!(agent_entries(&record)[0].0, "Selvä, varaan ajan.");
    assert_eq!(record.end_reason.code(), "requested");
}

#[tokio::test(start_paused = true)]
async fn test_single_loud_frame_does_not_interrupt() {
    let reasoning = StubReasoning::replying("A fairly long answer that keeps going.");
    let h = start_call(reasoning, CallSettings::default(), None, 10);

    h.transcripts.send(final_transcript("Hello?")).unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Speaking).await;
    h.transport.send(loud_frame()).await.unwrap();
    h.transport
        .send(TransportEvent::Audio(AudioFrame {
            samples: vec![0; 320],
            timestamp_ms: 20,
        }))
        .await
        .unwrap();

    wait_until(&h.handle, |s| s.turn_count == 1 && s.state == CallState::Idle).await;
    let (record, log) = finish(h, EndReason::Requested { reason: "done".into() }).await;
    assert!(!log.contains(&SinkEvent::Clear));
    assert!(!record.transitions.iter().any(|t| t.to == CallState::Interrupted));
}

#[tokio::test(start_paused = true)]
async fn test_forced_end_mid_speech() {
    let reasoning = StubReasoning::replying("This answer is long enough to still be playing.");
    let h = start_call(reasoning, CallSettings::default(), None, 50);

    h.transcripts.send(final_transcript("Talk to me.")).unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Speaking).await;
    let (record, log) = finish(h, EndReason::MaxDurationExceeded).await;

    assert_eq!(record.end_reason, EndReason::MaxDurationExceeded);
    let last = record.transitions.last().unwrap();
    assert_eq!((last.from, last.to), (CallState::Speaking, CallState::Ended));

    let clear_at = log.iter().position(|e| *e == SinkEvent::Clear).unwrap();
    assert!(log[clear_at..].iter().all(|e| !matches!(e, SinkEvent::Audio { .. })));
    assert_eq!(log.last(), Some(&SinkEvent::Hangup("max_duration_exceeded".into())));
    assert!(agent_entries(&record)[0].2);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_reasoning_error_plays_fallback_then_hangs_up() {
    let reasoning = StubReasoning::failing(AdapterError::fatal("stub-llm", "invalid api key"));
    let h = start_call(reasoning, CallSettings::default(), None, 4);

    h.transcripts.send(final_transcript("Kerro sää")).unwrap();
    let record = tokio::time::timeout(Duration::from_secs(60), h.task)
        .await
        .expect("call did not end")
        .unwrap();
    let log = h.sink.log();

    assert!(matches!(&record.end_reason, EndReason::AdapterFatal { adapter, .. } if adapter == "stub-llm"));
    let hangup_at = log.iter().position(|e| matches!(e, SinkEvent::Hangup(_))).unwrap();
    let fallback_audio = log[..hangup_at].iter().filter(|e| matches!(e, SinkEvent::Audio { .. })).count();
    assert_eq!(fallback_audio, 4);
    assert_eq!(log[hangup_at], SinkEvent::Hangup("adapter_fatal".into()));

    let agent = agent_entries(&record);
    assert_eq!(agent.last().map(|a| a.1), Some(ResponseSource::Fallback));
}

#[tokio::test(start_paused = true)]
async fn test_undelivered_fallback_is_not_recorded_as_spoken() {
    let reasoning = StubReasoning::failing(AdapterError::fatal("stub-llm", "invalid api key"));
    let sink = Arc::new(RecordingSink {
        reject_audio: true,
        ..RecordingSink::default()
    });
    let h = start_call_with_sink(reasoning, CallSettings::default(), None, 4, sink);

    h.transcripts.send(final_transcript("Kerro sää")).unwrap();
    let record = tokio::time::timeout(Duration::from_secs(60), h.task)
        .await
        .expect("call did not end")
        .unwrap();

    assert!(matches!(&record.end_reason, EndReason::AdapterFatal { adapter, .. } if adapter == "stub-llm"));
    assert!(agent_entries(&record).iter().all(|a| a.1 != ResponseSource::Fallback));
    assert!(system_events(&record).contains(&"fallback_undelivered".to_string()));
    let log = h.sink.log();
    assert!(log.iter().all(|e| !matches!(e, SinkEvent::Audio { .. })));
    assert_eq!(log.last(), Some(&SinkEvent::Hangup("adapter_fatal".into())));
}

#[tokio::test(start_paused = true)]
async fn test_greeting_then_injected_response() {
    let reasoning = StubReasoning::replying("unused");
    let h = start_call(reasoning.clone(), CallSettings::default(), Some("Hei, täällä Rusty."), 2);

    wait_until(&h.handle, |s| s.turn_count == 1 && s.state == CallState::Idle).await;
    h.handle.speak("Your table is booked.").await.unwrap();
    wait_until(&h.handle, |s| s.turn_count == 2 && s.state == CallState::Idle).await;

    let (record, _) = finish(h, EndReason::Requested { reason: "done".into() }).await;
    let sources: Vec<ResponseSource> = agent_entries(&record).iter().map(|a| a.1).collect();
    assert_eq!(sources, [ResponseSource::Greeting, ResponseSource::Injected]);
    assert!(reasoning.requests.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_utterances_queue_when_barge_in_disabled() {
    let mut settings = CallSettings::default();
    settings.barge_in.enabled = false;
    let reasoning = StubReasoning::replying("Sure, one moment please.");
    let h = start_call(reasoning.clone(), settings, None, 10);

    h.transcripts.send(final_transcript("First question?")).unwrap();
    wait_until(&h.handle, |s| s.state == CallState::Speaking).await;
    for _ in 0..3 {
        h.transport.send(loud_frame()).await.unwrap();
    }
    h.transcripts.send(final_transcript("Second question?")).unwrap();

    wait_until(&h.handle, |s| s.turn_count == 2 && s.state == CallState::Idle).await;
    let (record, log) = finish(h, EndReason::Requested { reason: "done".into() }).await;

    assert!(!log.contains(&SinkEvent::Clear));
    assert_eq!(reasoning.requests.lock().unwrap().len(), 2);
    assert!(agent_entries(&record).iter().all(|a| !a.2));
}

#[tokio::test(start_paused = true)]
async fn test_end_before_connect() {
    let reasoning = StubReasoning::replying("unused");
    let (_tx, rx) = mpsc::unbounded_channel();
    let collaborators = Collaborators {
        reasoning,
        stt: Arc::new(ScriptedStt {
            events: Mutex::new(Some(rx)),
        }),
        tts: Arc::new(StubTts { chunks: 1 }),
        voice: VoiceConfig::default(),
        fallback: Arc::new(FallbackAudio::new("Sorry.")),
    };
    let options = CallOptions {
        call_id: CallId::new(),
        settings: Arc::new(CallSettings::default()),
        call_context: String::new(),
        greeting: None,
    };
    let (handle, task) = spawn_call(
        options,
        collaborators,
        std::future::pending::<Result<TransportLink, AdapterError>>(),
    );

    handle.end(EndReason::Requested { reason: "cancelled".into() }).await.unwrap();
    let record = task.await.unwrap();
    assert!(record.transitions.is_empty());
    assert_eq!(record.end_reason.code(), "requested");
    assert_eq!(handle.snapshot().state, CallState::Ended);
    assert!(handle.speak("too late").await.is_err());
}
