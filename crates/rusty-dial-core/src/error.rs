use thiserror::Error;

use crate::types::CallId;

#[derive(Debug, Error)]
pub enum RustyDialError {
    #[error("Capacity exceeded: {live} live calls, ceiling is {ceiling}")]
    CapacityExceeded { live: usize, ceiling: usize },

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Call already ended: {0}")]
    CallEnded(CallId),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Stale result for turn {got} (current turn is {current})")]
    StaleResult { got: u64, current: u64 },

    #[error("Maximum call duration exceeded after {elapsed_secs}s")]
    MaxDurationExceeded { elapsed_secs: u64 },

    #[error("Missing parameter: {0}")]
    MissingParam(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RustyDialError {
    /// Wire error code used by the control plane.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InvalidDestination(_) => "invalid_destination",
            Self::CallNotFound(_) => "call_not_found",
            Self::CallEnded(_) => "call_ended",
            Self::Adapter(AdapterError::Transient { .. }) => "adapter_transient",
            Self::Adapter(AdapterError::Fatal { .. }) => "adapter_fatal",
            Self::StaleResult { .. } => "stale_result",
            Self::MaxDurationExceeded { .. } => "max_duration_exceeded",
            Self::MissingParam(_) => "missing_param",
            Self::InvalidParams(_) => "invalid_params",
            Self::UnknownAction(_) => "unknown_action",
            Self::Config(_) => "config",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "internal",
        }
    }
}

/// Failure reported by an STT, TTS, reasoning or transport adapter.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// A hiccup worth retrying (timeouts, 429s, 5xx).
    #[error("{adapter} transient error: {message}")]
    Transient { adapter: String, message: String },

    /// The adapter is unusable for the rest of the call.
    #[error("{adapter} fatal error: {message}")]
    Fatal { adapter: String, message: String },
}

impl AdapterError {
    pub fn transient(adapter: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transient {
            adapter: adapter.into(),
            message: message.to_string(),
        }
    }

    pub fn fatal(adapter: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fatal {
            adapter: adapter.into(),
            message: message.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn adapter(&self) -> &str {
        match self {
            Self::Transient { adapter, .. } | Self::Fatal { adapter, .. } => adapter,
        }
    }

    /// Classify an HTTP status the way vendor APIs use them.
    pub fn from_status(adapter: impl Into<String>, status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        if status == 408 || status == 429 || status >= 500 {
            Self::transient(adapter, message)
        } else {
            Self::fatal(adapter, message)
        }
    }
}

pub type Result<T> = std::result::Result<T, RustyDialError>;
