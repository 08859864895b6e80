//! Finalized caller utterances.

use serde::Serialize;

/// Confidence assigned to spans finalized after an STT failure.
pub const DEGRADED_CONFIDENCE: f32 = 0.3;

const QUESTION_WORDS: &[&str] = &[
    // English
    "what", "why", "how", "when", "where", "who", "which", "whose", "is", "are", "can",
    "could", "do", "does", "did", "will", "would", "should",
    // Finnish
    "mikä", "mitä", "miksi", "miten", "milloin", "missä", "mistä", "mihin", "kuka", "kenen",
    "kuinka", "paljonko", "onko", "voiko", "voitko", "voisitko", "saako", "tiedätkö",
];

/// Why a span was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// The silence wait elapsed.
    Silence,
    /// The span hit the hard length ceiling.
    Ceiling,
    /// The STT adapter failed mid-span.
    AdapterError,
    /// The call ended with speech still buffered.
    Flush,
}

/// Everything the segmenter knows about a span at the moment it closes.
#[derive(Debug, Clone)]
pub struct UtteranceParts {
    pub id: u64,
    pub deltas: Vec<String>,
    pub confidence: f32,
    pub language: Option<String>,
    pub started_at_ms: u64,
    pub finalized_at_ms: u64,
    pub reason: FinalizeReason,
    pub is_interruption: bool,
}

/// A bounded span of caller speech.
///
/// Only produced when a span is finalized, and has no mutating methods, so a
/// finalized utterance can never be reopened or extended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    id: u64,
    deltas: Vec<String>,
    text: String,
    confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    started_at_ms: u64,
    finalized_at_ms: u64,
    reason: FinalizeReason,
    degraded: bool,
    is_question: bool,
    is_interruption: bool,
}

impl Utterance {
    pub fn finalize(parts: UtteranceParts) -> Self {
        let text = parts
            .deltas
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let degraded = parts.reason == FinalizeReason::AdapterError;
        let confidence = if degraded {
            parts.confidence.min(DEGRADED_CONFIDENCE)
        } else {
            parts.confidence
        };
        let is_question = looks_like_question(&text);

        Self {
            id: parts.id,
            deltas: parts.deltas,
            text,
            confidence,
            language: parts.language,
            started_at_ms: parts.started_at_ms,
            finalized_at_ms: parts.finalized_at_ms,
            reason: parts.reason,
            degraded,
            is_question,
            is_interruption: parts.is_interruption,
        }
    }

    /// Per-call sequential id; ids are strictly increasing in creation order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deltas(&self) -> &[String] {
        &self.deltas
    }

    /// The full transcript. Callers must pass it through the isolation filter
    /// before it goes anywhere near a reasoning backend.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn finalized_at_ms(&self) -> u64 {
        self.finalized_at_ms
    }

    pub fn reason(&self) -> FinalizeReason {
        self.reason
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_question(&self) -> bool {
        self.is_question
    }

    /// True if the span opened while the agent held the floor.
    pub fn is_interruption(&self) -> bool {
        self.is_interruption
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Question heuristic: trailing `?`, a leading interrogative, or a Finnish
/// `-ko`/`-kö` clitic on the first word.
pub fn looks_like_question(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.ends_with('?') {
        return true;
    }
    let Some(first) = trimmed.split_whitespace().next() else {
        return false;
    };
    let first = first
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if QUESTION_WORDS.contains(&first.as_str()) {
        return true;
    }
    first.chars().count() > 4 && (first.ends_with("ko") || first.ends_with("kö"))
}
