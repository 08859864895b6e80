//! Wire shapes for the control plane and the media socket.
//!
//! Control requests are `{"action": "...", "params": {...}}`; every response
//! carries the data-only security notice because it may contain transcripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RustyDialError;
use crate::isolation::SECURITY_NOTICE;

/// Control-plane actions.
pub const ACTIONS: &[&str] = &["start_call", "respond", "transfer", "hangup", "list_calls", "get_history"];

/// A control-plane request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartCallParams {
    #[serde(default)]
    pub to: Option<String>,
    /// Background handed to the reasoning backend for every turn of the call.
    #[serde(default)]
    pub context: String,
    /// Spoken as soon as the callee picks up. Empty = wait for the callee.
    #[serde(default)]
    pub greeting: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RespondParams {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferParams {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HangupParams {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default = "default_hangup_reason")]
    pub reason: String,
}

fn default_hangup_reason() -> String {
    "normal".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallRef {
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Error shape returned in failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&RustyDialError> for ErrorShape {
    fn from(err: &RustyDialError) -> Self {
        let details = match err {
            RustyDialError::CapacityExceeded { live, ceiling } => {
                Some(serde_json::json!({ "live": live, "ceiling": ceiling }))
            }
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

/// Standard response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "_security_notice")]
    pub security_notice: String,
}

impl ControlResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
            security_notice: SECURITY_NOTICE.to_string(),
        }
    }

    pub fn err(error: ErrorShape) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: Utc::now(),
            security_notice: SECURITY_NOTICE.to_string(),
        }
    }
}

/// JSON text frames exchanged on a media socket. Audio travels as binary
/// frames of 16-bit little-endian PCM, 16 kHz mono.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediaEvent {
    /// Either side ends the call.
    Hangup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Server asks the client to drop any audio it has buffered.
    Clear,
    /// Server asks the telephony front end to move the caller to `to`.
    /// A `hangup` with reason `transferred` follows.
    Transfer { to: String },
}
