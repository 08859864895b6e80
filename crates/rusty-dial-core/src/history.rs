//! Per-call conversation history.
//!
//! Append-only: entries are pushed in order and never edited or removed.

use std::sync::Arc;

use serde::Serialize;

use crate::isolation::TaggedInput;
use crate::utterance::Utterance;

/// Coarse topic tag derived from caller speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Weather,
    Time,
    News,
    Help,
    General,
}

const TOPIC_KEYWORDS: &[(Topic, &[&str])] = &[
    (
        Topic::Weather,
        &["weather", "forecast", "temperature", "rain", "snow", "sää", "ennuste", "lämpötila", "sade", "lumi"],
    ),
    (
        Topic::Time,
        &["time", "date", "day", "hour", "minute", "aika", "kello", "päivä", "tunti"],
    ),
    (
        Topic::News,
        &["news", "headlines", "events", "happening", "uutiset", "uutisia"],
    ),
    (
        Topic::Help,
        &["help", "assistance", "support", "problem", "apua", "auta", "tuki", "ongelma"],
    ),
    (
        Topic::General,
        &["hello", "hi", "bye", "goodbye", "thank", "thanks", "hei", "moi", "kiitos", "näkemiin"],
    ),
];

/// First topic whose keyword matches a whole word of `text`.
pub fn extract_topic(text: &str) -> Option<Topic> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    TOPIC_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| words.contains(k)))
        .map(|(topic, _)| *topic)
}

/// Where an agent response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Produced by the reasoning backend.
    Generated,
    /// Injected through the control plane.
    Injected,
    /// Opening line of the call.
    Greeting,
    /// The predefined apology spoken after a fatal error.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Caller {
        utterance: Arc<Utterance>,
        input: TaggedInput,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<Topic>,
        at_ms: u64,
    },
    Agent {
        text: String,
        seq: u64,
        source: ResponseSource,
        interrupted: bool,
        at_ms: u64,
    },
    System {
        event: String,
        data: serde_json::Value,
        at_ms: u64,
    },
}

/// One prior exchange as seen by a reasoning backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextTurn {
    Caller(TaggedInput),
    Agent(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationHistory {
    entries: Vec<HistoryEntry>,
    topics: Vec<Topic>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized caller utterance together with its wrapped form.
    pub fn push_caller(&mut self, utterance: Arc<Utterance>, input: TaggedInput, at_ms: u64) {
        debug_assert!(
            self.last_utterance_id().is_none_or(|last| last < utterance.id()),
            "utterances must be appended in creation order"
        );
        let topic = extract_topic(utterance.text());
        if let Some(topic) = topic {
            if self.topics.last() != Some(&topic) {
                self.topics.push(topic);
            }
        }
        self.entries.push(HistoryEntry::Caller {
            utterance,
            input,
            topic,
            at_ms,
        });
    }

    pub fn push_agent(
        &mut self,
        text: impl Into<String>,
        seq: u64,
        source: ResponseSource,
        interrupted: bool,
        at_ms: u64,
    ) {
        self.entries.push(HistoryEntry::Agent {
            text: text.into(),
            seq,
            source,
            interrupted,
            at_ms,
        });
    }

    pub fn push_system(&mut self, event: impl Into<String>, data: serde_json::Value, at_ms: u64) {
        self.entries.push(HistoryEntry::System {
            event: event.into(),
            data,
            at_ms,
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Topic tags in the order they came up (consecutive repeats collapsed).
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn current_topic(&self) -> Option<Topic> {
        self.topics.last().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn last_utterance_id(&self) -> Option<u64> {
        self.entries.iter().rev().find_map(|e| match e {
            HistoryEntry::Caller { utterance, .. } => Some(utterance.id()),
            _ => None,
        })
    }

    /// The most recent `max_turns` caller/agent exchanges, oldest first.
    /// System entries are never shown to a reasoning backend.
    pub fn reasoning_context(&self, max_turns: usize) -> Vec<ContextTurn> {
        let mut turns: Vec<ContextTurn> = self
            .entries
            .iter()
            .rev()
            .filter_map(|e| match e {
                HistoryEntry::Caller { input, .. } => Some(ContextTurn::Caller(input.clone())),
                HistoryEntry::Agent { text, .. } if !text.is_empty() => {
                    Some(ContextTurn::Agent(text.clone()))
                }
                _ => None,
            })
            .take(max_turns)
            .collect();
        turns.reverse();
        turns
    }
}
