//! Call lifecycle callbacks.
//!
//! When `calls.callback_url` is set, `incoming_call` and `call_ended` are
//! POSTed there as JSON objects carrying an `event` field. Delivery is
//! fire-and-forget: failures are logged and never touch the call.

use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rusty_dial_core::isolation::SECURITY_NOTICE;
use rusty_dial_core::types::{CallId, EndReason};

use crate::policy::redact;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct CallbackNotifier {
    url: Option<String>,
    client: reqwest::Client,
}

impl CallbackNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url: url.filter(|u| !u.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// An inbound call was admitted.
    pub fn incoming_call(&self, call_id: CallId, from: &str, to: &str) -> Option<JoinHandle<()>> {
        self.send(
            "incoming_call",
            json!({
                "call_id": call_id,
                "caller": redact(from),
                "callee": to,
            }),
        )
    }

    /// A call was archived.
    pub fn call_ended(&self, call_id: CallId, reason: &EndReason, duration_seconds: u64) -> Option<JoinHandle<()>> {
        self.send(
            "call_ended",
            json!({
                "call_id": call_id,
                "reason": reason.code(),
                "duration_seconds": duration_seconds,
            }),
        )
    }

    fn send(&self, event: &'static str, mut payload: serde_json::Value) -> Option<JoinHandle<()>> {
        let url = self.url.clone()?;
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("event".into(), event.into());
            fields.insert("_security_notice".into(), SECURITY_NOTICE.into());
        }
        let client = self.client.clone();
        Some(tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(CALLBACK_TIMEOUT)
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => debug!(event, "Callback delivered"),
                Ok(resp) => warn!(event, status = resp.status().as_u16(), "Callback rejected"),
                Err(e) => warn!(event, error = %e, "Callback failed"),
            }
        }))
    }
}
