//! Control-plane operations.
//!
//! Each operation returns a JSON payload or a typed [`RustyDialError`]; the
//! HTTP layer wraps both in the standard response envelope.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use rusty_dial_core::error::{AdapterError, Result, RustyDialError};
use rusty_dial_core::protocol::{
    CallRef, ControlRequest, HangupParams, RespondParams, StartCallParams, TransferParams,
};
use rusty_dial_core::types::{CallId, CallInfo, Direction, EndReason};
use rusty_dial_media::call::{CallOptions, spawn_call};
use rusty_dial_providers::{Telephony, TransportLink};

use crate::policy::redact;
use crate::state::GatewayState;

/// Run a control request.
pub async fn execute(state: &Arc<GatewayState>, request: ControlRequest) -> Result<serde_json::Value> {
    debug!(action = %request.action, "Executing control action");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let result = execute_inner(state, &request.action, request.params).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(&request.action, start.elapsed().as_secs_f64());

    result
}

async fn execute_inner(state: &Arc<GatewayState>, action: &str, params: serde_json::Value) -> Result<serde_json::Value> {
    match action {
        "start_call" => start_call(state, parse_params(params)?),
        "respond" => respond(state, parse_params(params)?).await,
        "transfer" => transfer(state, parse_params(params)?).await,
        "hangup" => hangup(state, parse_params(params)?).await,
        "list_calls" => Ok(list_calls(state)),
        "get_history" => get_history(state, parse_params(params)?),
        other => Err(RustyDialError::UnknownAction(other.to_string())),
    }
}

fn parse_params<T: DeserializeOwned + Default>(params: serde_json::Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| RustyDialError::InvalidParams(e.to_string()))
}

fn required(raw: Option<&str>, name: &str) -> Result<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RustyDialError::MissingParam(name.into()))
}

fn call_id_param(raw: Option<String>) -> Result<CallId> {
    let raw = raw.ok_or_else(|| RustyDialError::MissingParam("call_id".into()))?;
    raw.trim()
        .parse()
        .map_err(|_| RustyDialError::InvalidParams(format!("'{raw}' is not a call id")))
}

/// Phone numbers are never listed in full.
fn redacted(info: CallInfo) -> CallInfo {
    CallInfo {
        from: redact(&info.from),
        to: redact(&info.to),
        ..info
    }
}

/// Dial `to` and run the call once the callee's media connects.
pub fn start_call(state: &Arc<GatewayState>, params: StartCallParams) -> Result<serde_json::Value> {
    let to = required(params.to.as_deref(), "to")?;
    state.policy.check(&to)?;

    let from = state.caller_id();
    let greeting = Some(params.greeting).filter(|g| !g.trim().is_empty());
    let call_context = params.context;

    let handle = state
        .registry
        .open(Direction::Outbound, from.as_deref().unwrap_or_default(), &to, |call_id| {
            let telephony = state.telephony.clone();
            let (dial_from, dial_to) = (from.clone(), to.clone());
            let connect = async move { telephony.dial(call_id, dial_from.as_deref(), &dial_to).await };
            let options = CallOptions {
                call_id,
                settings: state.settings.clone(),
                call_context,
                greeting,
            };
            spawn_call(options, state.collaborators.clone(), connect)
        })?;

    let call_id = handle.call_id();
    info!(%call_id, to = %redact(&to), "Outbound call started");
    Ok(json!({
        "call_id": call_id,
        "status": "dialing",
        "to": redact(&to),
        "media_url": state.bridge.media_url(call_id),
    }))
}

/// Admit an inbound call whose transport resolves through `connect`.
pub fn accept_inbound<F>(state: &Arc<GatewayState>, from: &str, to: &str, connect: F) -> Result<CallId>
where
    F: Future<Output = std::result::Result<TransportLink, AdapterError>> + Send + 'static,
{
    let handle = state.registry.open(Direction::Inbound, from, to, |call_id| {
        let options = CallOptions {
            call_id,
            settings: state.settings.clone(),
            call_context: String::new(),
            greeting: None,
        };
        spawn_call(options, state.collaborators.clone(), connect)
    })?;
    info!(call_id = %handle.call_id(), from = %redact(from), "Inbound call accepted");
    Ok(handle.call_id())
}

/// Inject an agent response into a live call.
pub async fn respond(state: &Arc<GatewayState>, params: RespondParams) -> Result<serde_json::Value> {
    let call_id = call_id_param(params.call_id)?;
    let text = params.text.trim();
    if text.is_empty() {
        return Err(RustyDialError::MissingParam("text".into()));
    }
    let handle = state.registry.get(call_id)?;
    if handle.snapshot().end_reason.is_some() {
        return Err(RustyDialError::CallEnded(call_id));
    }
    handle.speak(text).await?;
    Ok(json!({ "call_id": call_id, "status": "queued" }))
}

/// Hand a live call over to another number, then end it on our side.
pub async fn transfer(state: &Arc<GatewayState>, params: TransferParams) -> Result<serde_json::Value> {
    let call_id = call_id_param(params.call_id)?;
    let handle = state.registry.get(call_id)?;
    if handle.snapshot().end_reason.is_some() {
        return Err(RustyDialError::CallEnded(call_id));
    }
    let to = required(params.to.as_deref(), "to")?;
    state.policy.check(&to)?;

    state.telephony.transfer(call_id, &to).await?;
    info!(%call_id, to = %redact(&to), "Call transferred");
    state
        .registry
        .close(call_id, EndReason::Transferred { to: redact(&to) })
        .await?;
    Ok(json!({ "call_id": call_id, "status": "transferred", "to": redact(&to) }))
}

pub async fn hangup(state: &Arc<GatewayState>, params: HangupParams) -> Result<serde_json::Value> {
    let call_id = call_id_param(params.call_id)?;
    state
        .registry
        .close(call_id, EndReason::Requested { reason: params.reason })
        .await?;
    Ok(json!({ "call_id": call_id, "status": "ending" }))
}

pub fn list_calls(state: &Arc<GatewayState>) -> serde_json::Value {
    let calls: Vec<CallInfo> = state.registry.list().into_iter().map(redacted).collect();
    json!({
        "count": calls.len(),
        "max_concurrent": state.registry.limits().max_concurrent,
        "calls": calls,
    })
}

/// Conversation of a live or recently ended call.
pub fn get_history(state: &Arc<GatewayState>, params: CallRef) -> Result<serde_json::Value> {
    let call_id = call_id_param(params.call_id)?;
    let view = state
        .registry
        .lookup(call_id)
        .ok_or(RustyDialError::CallNotFound(call_id))?;
    Ok(json!({
        "call": redacted(view.info),
        "topics": view.history.topics(),
        "entries": view.history.entries(),
    }))
}
