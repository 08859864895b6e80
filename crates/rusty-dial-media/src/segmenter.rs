//! Transcript segmentation: turns a stream of partial/final transcript events
//! into bounded [`Utterance`]s.
//!
//! The segmenter is a pure state machine driven by event timestamps and an
//! explicit `now`; it never reads a clock itself, so identical input always
//! yields identical utterances.

use rusty_dial_core::config::TurnTakingConfig;
use rusty_dial_core::types::TranscriptEvent;
use rusty_dial_core::utterance::{FinalizeReason, Utterance, UtteranceParts};
use tracing::debug;

const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', '…'];

#[derive(Debug)]
struct OpenSpan {
    id: u64,
    finals: Vec<String>,
    interim: Option<String>,
    confidence_sum: f32,
    confidence_count: u32,
    interim_confidence: f32,
    language: Option<String>,
    started_at_ms: u64,
    last_event_ms: u64,
    is_interruption: bool,
}

impl OpenSpan {
    fn tail_text(&self) -> &str {
        self.interim
            .as_deref()
            .or_else(|| self.finals.last().map(String::as_str))
            .unwrap_or("")
    }

    fn confidence(&self) -> f32 {
        if self.confidence_count > 0 {
            self.confidence_sum / self.confidence_count as f32
        } else {
            self.interim_confidence
        }
    }
}

#[derive(Debug)]
pub struct Segmenter {
    config: TurnTakingConfig,
    next_id: u64,
    span: Option<OpenSpan>,
}

impl Segmenter {
    pub fn new(config: TurnTakingConfig) -> Self {
        Self {
            config,
            next_id: 1,
            span: None,
        }
    }

    pub fn has_open_span(&self) -> bool {
        self.span.is_some()
    }

    /// Feed one transcript event.
    ///
    /// Returns an utterance when the event shows that the open span had
    /// already gone silent past its deadline, or when this event pushes the
    /// span over the length ceiling. `agent_has_floor` marks a newly opened
    /// span as an interruption.
    pub fn push(&mut self, event: &TranscriptEvent, agent_has_floor: bool) -> Option<Utterance> {
        let text = event.text.trim();
        if text.is_empty() {
            return None;
        }
        let now = event.timestamp_ms;

        // The previous span went quiet long enough before this event arrived.
        let expired = match self.deadline() {
            Some(deadline) if deadline <= now => self.poll(deadline),
            _ => None,
        };

        let span = self.span.get_or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            debug!(utterance_id = id, at_ms = now, "Opened caller span");
            OpenSpan {
                id,
                finals: Vec::new(),
                interim: None,
                confidence_sum: 0.0,
                confidence_count: 0,
                interim_confidence: 0.0,
                language: None,
                started_at_ms: now,
                last_event_ms: now,
                is_interruption: agent_has_floor,
            }
        });

        span.last_event_ms = span.last_event_ms.max(now);
        if event.language.is_some() {
            span.language = event.language.clone();
        }
        if event.is_final {
            span.finals.push(text.to_string());
            span.interim = None;
            span.confidence_sum += event.confidence;
            span.confidence_count += 1;
        } else {
            span.interim = Some(text.to_string());
            span.interim_confidence = event.confidence;
        }

        if expired.is_some() {
            return expired;
        }
        if now.saturating_sub(span.started_at_ms) >= self.config.max_utterance_ms {
            return self.close(now, FinalizeReason::Ceiling);
        }
        None
    }

    /// Finalize the open span if its deadline has passed.
    pub fn poll(&mut self, now_ms: u64) -> Option<Utterance> {
        let span = self.span.as_ref()?;
        let ceiling = span.started_at_ms + self.config.max_utterance_ms;
        if now_ms >= ceiling {
            return self.close(now_ms, FinalizeReason::Ceiling);
        }
        if now_ms >= span.last_event_ms + self.silence_wait(span.tail_text()) {
            return self.close(now_ms, FinalizeReason::Silence);
        }
        None
    }

    /// The STT adapter failed: close the open span as degraded.
    pub fn fail(&mut self, now_ms: u64) -> Option<Utterance> {
        self.close(now_ms, FinalizeReason::AdapterError)
    }

    /// The call is ending: close whatever is buffered.
    pub fn flush(&mut self, now_ms: u64) -> Option<Utterance> {
        self.close(now_ms, FinalizeReason::Flush)
    }

    /// Call-clock time at which the open span finalizes if nothing else arrives.
    pub fn deadline(&self) -> Option<u64> {
        let span = self.span.as_ref()?;
        let silence = span.last_event_ms + self.silence_wait(span.tail_text());
        let ceiling = span.started_at_ms + self.config.max_utterance_ms;
        Some(silence.min(ceiling))
    }

    /// How long to wait after the latest speech before closing the span.
    pub fn silence_wait(&self, tail: &str) -> u64 {
        let tail = tail.trim_end();
        let wait = if tail.ends_with(TERMINAL_PUNCTUATION) {
            self.config.punctuation_wait_ms
        } else if ends_with_bare_number(tail) {
            self.config.number_wait_ms
        } else {
            self.config.no_punctuation_wait_ms
        };
        wait.max(self.config.base_wait_ms)
    }

    fn close(&mut self, now_ms: u64, reason: FinalizeReason) -> Option<Utterance> {
        let span = self.span.take()?;
        let confidence = span.confidence();
        let mut deltas = span.finals;
        if let Some(interim) = span.interim {
            deltas.push(interim);
        }
        let utterance = Utterance::finalize(UtteranceParts {
            id: span.id,
            deltas,
            confidence,
            language: span.language,
            started_at_ms: span.started_at_ms,
            finalized_at_ms: now_ms.max(span.last_event_ms),
            reason,
            is_interruption: span.is_interruption,
        });
        debug!(
            utterance_id = utterance.id(),
            reason = ?reason,
            chars = utterance.text().len(),
            "Finalized caller utterance"
        );
        Some(utterance)
    }
}

/// Digits spoken without trailing punctuation, e.g. the first half of a
/// phone number: "040 123" or "+358".
fn ends_with_bare_number(text: &str) -> bool {
    let Some(token) = text.split_whitespace().last() else {
        return false;
    };
    let token = token.trim_end_matches(',');
    let token = token.strip_prefix('+').unwrap_or(token);
    token.chars().any(|c| c.is_ascii_digit()) && token.chars().all(|c| c.is_ascii_digit() || c == '-')
}
