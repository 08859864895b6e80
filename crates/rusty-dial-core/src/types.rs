//! Shared call, turn and media types.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque call identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Turn-taking state of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Connected, nobody has spoken yet (or the last agent turn finished).
    #[default]
    Idle,
    /// Caller holds the floor.
    Listening,
    /// Agent is generating a response; the caller may still interrupt.
    Thinking,
    /// Agent audio is playing out.
    Speaking,
    /// Caller speech cut into an agent turn.
    Interrupted,
    /// Terminal.
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
            Self::Ended => "ended",
        }
    }

    /// Who holds the floor in this state.
    pub fn holder(&self) -> TurnHolder {
        match self {
            Self::Listening | Self::Interrupted => TurnHolder::Caller,
            Self::Thinking | Self::Speaking => TurnHolder::Agent,
            Self::Idle | Self::Ended => TurnHolder::None,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnHolder {
    Caller,
    Agent,
    None,
}

/// Ephemeral view of who holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub holder: TurnHolder,
    /// Call-clock time (ms since the call opened) at which the holder took the floor.
    pub acquired_at_ms: u64,
    /// Monotonic turn sequence number; results tagged with an older value are stale.
    pub seq: u64,
}

/// Why a call ended. Surfaced through status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum EndReason {
    /// The remote party hung up or the transport went away.
    CallerHangup,
    /// Ended through the control plane.
    Requested { reason: String },
    /// Handed to another number through the control plane.
    Transferred { to: String },
    /// Forced by the duration sweeper.
    MaxDurationExceeded,
    /// An adapter became unusable.
    AdapterFatal { adapter: String, message: String },
    /// The process is shutting down.
    Shutdown,
}

impl EndReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CallerHangup => "caller_hangup",
            Self::Requested { .. } => "requested",
            Self::Transferred { .. } => "transferred",
            Self::MaxDurationExceeded => "max_duration_exceeded",
            Self::AdapterFatal { .. } => "adapter_fatal",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested { reason } => write!(f, "requested: {reason}"),
            Self::Transferred { to } => write!(f, "transferred to {to}"),
            Self::AdapterFatal { adapter, message } => write!(f, "{adapter} failed: {message}"),
            other => f.write_str(other.code()),
        }
    }
}

/// A frame of inbound caller audio: 16-bit PCM, 16 kHz mono.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    /// Monotonic media timestamp supplied by the transport, in ms.
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Decode little-endian PCM bytes. A trailing odd byte is ignored.
    pub fn from_le_bytes(raw: &[u8], timestamp_ms: u64) -> Self {
        let samples = raw
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self {
            samples,
            timestamp_ms,
        }
    }

    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        (self.samples.len() as u64 * 1000) / sample_rate.max(1) as u64
    }
}

/// Incremental STT result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Synthesized audio tagged with the turn it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedChunk {
    pub seq: u64,
    /// Position of the source sentence within the turn.
    pub index: usize,
    pub data: Bytes,
}

/// Events delivered by a transport link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Audio(AudioFrame),
    Hangup,
}

/// Summary of a call as exposed by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub direction: Direction,
    pub from: String,
    pub to: String,
    pub state: CallState,
    pub turn_count: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}
