//! WebSocket media bridge: the built-in transport.
//!
//! A telephony front end (or a test client) connects one WebSocket per call.
//! Binary frames carry 16-bit LE PCM at 16 kHz mono in both directions; text
//! frames carry [`MediaEvent`]s. Outbound calls are "dialed" by parking a
//! connect slot that the media socket later claims. Transfers are sent down
//! the call's socket as a `transfer` event.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use rusty_dial_core::error::AdapterError;
use rusty_dial_core::protocol::MediaEvent;
use rusty_dial_core::types::{AudioFrame, CallId, EndReason, TaggedChunk, TransportEvent};
use rusty_dial_media::SAMPLE_RATE;
use rusty_dial_media::call::TRANSPORT_ADAPTER;
use rusty_dial_providers::{AudioSink, Telephony, TransportLink};

use crate::policy::redact;

/// Inbound frames buffered ahead of the call task (2 s of 20 ms frames).
const INBOUND_BUFFER: usize = 100;

type ConnectSlot = oneshot::Sender<TransportLink>;
type SocketOut = mpsc::UnboundedSender<Outbound>;

pub struct MediaBridge {
    media_base: String,
    dial_webhook: Option<String>,
    transfer_webhook: Option<String>,
    pending: Mutex<HashMap<CallId, ConnectSlot>>,
    /// Outbound halves of connected media sockets.
    sockets: Mutex<HashMap<CallId, SocketOut>>,
    client: reqwest::Client,
}

impl MediaBridge {
    /// `media_base` is the externally reachable `ws://`/`wss://` origin of
    /// this gateway.
    pub fn new(media_base: impl Into<String>, dial_webhook: Option<String>) -> Self {
        Self {
            media_base: media_base.into().trim_end_matches('/').to_string(),
            dial_webhook,
            transfer_webhook: None,
            pending: Mutex::new(HashMap::new()),
            sockets: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_transfer_webhook(mut self, transfer_webhook: Option<String>) -> Self {
        self.transfer_webhook = transfer_webhook;
        self
    }

    pub fn media_url(&self, call_id: CallId) -> String {
        format!("{}/ws/calls/{call_id}", self.media_base)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, ConnectSlot>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the connect slot of a dialed call. Each slot can be claimed once.
    pub fn claim(&self, call_id: CallId) -> Option<ConnectSlot> {
        self.lock().remove(&call_id)
    }

    pub fn is_dialing(&self, call_id: CallId) -> bool {
        self.lock().contains_key(&call_id)
    }

    fn sockets(&self) -> MutexGuard<'_, HashMap<CallId, SocketOut>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the outbound half of a connected media socket until the
    /// returned guard drops.
    fn attach(&self, call_id: CallId, out: SocketOut) -> AttachedSocket<'_> {
        self.sockets().insert(call_id, out);
        AttachedSocket { bridge: self, call_id }
    }

    pub fn is_connected(&self, call_id: CallId) -> bool {
        self.sockets().contains_key(&call_id)
    }

    async fn notify(&self, hook: &str, what: &str, body: serde_json::Value) -> Result<(), AdapterError> {
        let resp = self
            .client
            .post(hook)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::fatal(TRANSPORT_ADAPTER, format!("{what} webhook failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::fatal(
                TRANSPORT_ADAPTER,
                format!("{what} webhook rejected the call: HTTP {status}: {body}"),
            ));
        }
        Ok(())
    }
}

struct AttachedSocket<'a> {
    bridge: &'a MediaBridge,
    call_id: CallId,
}

impl Drop for AttachedSocket<'_> {
    fn drop(&mut self) {
        self.bridge.sockets().remove(&self.call_id);
    }
}

/// Removes a parked connect slot when dialing stops, however it stops.
struct ParkedSlot<'a> {
    bridge: &'a MediaBridge,
    call_id: CallId,
}

impl Drop for ParkedSlot<'_> {
    fn drop(&mut self) {
        self.bridge.lock().remove(&self.call_id);
    }
}

#[async_trait]
impl Telephony for MediaBridge {
    async fn dial(&self, call_id: CallId, from: Option<&str>, to: &str) -> Result<TransportLink, AdapterError> {
        let (slot, connected) = oneshot::channel();
        self.lock().insert(call_id, slot);
        let _parked = ParkedSlot { bridge: self, call_id };

        if let Some(hook) = &self.dial_webhook {
            let body = json!({
                "call_id": call_id,
                "from": from,
                "to": to,
                "media_url": self.media_url(call_id),
            });
            self.notify(hook, "dial", body).await?;
        }
        info!(%call_id, to = %redact(to), media_url = %self.media_url(call_id), "Dialing, waiting for media socket");
        await_link(connected).await
    }

    async fn transfer(&self, call_id: CallId, to: &str) -> Result<(), AdapterError> {
        let socket = self.sockets().get(&call_id).cloned();
        if socket.is_none() && self.transfer_webhook.is_none() {
            return Err(AdapterError::fatal(TRANSPORT_ADAPTER, "call has no media socket to transfer"));
        }
        if let Some(hook) = &self.transfer_webhook {
            self.notify(hook, "transfer", json!({ "call_id": call_id, "to": to })).await?;
        }
        if let Some(out) = socket {
            out.send(Outbound::Transfer(to.to_string()))
                .map_err(|_| AdapterError::fatal(TRANSPORT_ADAPTER, "media socket closed"))?;
        }
        info!(%call_id, to = %redact(to), "Transfer requested");
        Ok(())
    }
}

/// Resolve once a media socket hands over its link.
pub fn await_link(
    connected: oneshot::Receiver<TransportLink>,
) -> impl Future<Output = Result<TransportLink, AdapterError>> + Send + 'static {
    async move {
        connected
            .await
            .map_err(|_| AdapterError::fatal(TRANSPORT_ADAPTER, "media socket never connected"))
    }
}

enum Outbound {
    Audio(Bytes),
    Clear,
    Transfer(String),
    Hangup(String),
}

/// Outbound half of a media socket.
struct SocketSink {
    out: mpsc::UnboundedSender<Outbound>,
}

impl SocketSink {
    fn push(&self, item: Outbound) -> Result<(), AdapterError> {
        self.out
            .send(item)
            .map_err(|_| AdapterError::fatal(TRANSPORT_ADAPTER, "media socket closed"))
    }
}

#[async_trait]
impl AudioSink for SocketSink {
    async fn send_audio(&self, chunk: TaggedChunk) -> Result<(), AdapterError> {
        self.push(Outbound::Audio(chunk.data))
    }

    async fn clear(&self) -> Result<(), AdapterError> {
        self.push(Outbound::Clear)
    }

    async fn hangup(&self, reason: &EndReason) -> Result<(), AdapterError> {
        self.push(Outbound::Hangup(reason.code().to_string()))
    }
}

fn event_message(event: &MediaEvent) -> Option<Message> {
    serde_json::to_string(event).ok().map(|text| Message::Text(text.into()))
}

/// Pump one media socket until either side hangs up.
pub async fn serve_socket(bridge: Arc<MediaBridge>, mut socket: WebSocket, call_id: CallId, connect: ConnectSlot) {
    let (events_tx, events_rx) = mpsc::channel(INBOUND_BUFFER);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let _attached = bridge.attach(call_id, out_tx.clone());
    let link = TransportLink {
        events: events_rx,
        sink: Arc::new(SocketSink { out: out_tx }),
    };
    if connect.send(link).is_err() {
        warn!(%call_id, "Media socket connected for a call that has already ended");
        if let Some(msg) = event_message(&MediaEvent::Hangup {
            reason: Some("call_ended".into()),
        }) {
            let _ = socket.send(msg).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(%call_id, "Media socket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut samples_in: u64 = 0;

    loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    let timestamp_ms = samples_in * 1000 / u64::from(SAMPLE_RATE);
                    let frame = AudioFrame::from_le_bytes(&data, timestamp_ms);
                    samples_in += frame.samples.len() as u64;
                    match events_tx.try_send(TransportEvent::Audio(frame)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!(%call_id, "Inbound audio backlog, dropping frame"),
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<MediaEvent>(&text) {
                    Ok(MediaEvent::Hangup { reason }) => {
                        info!(%call_id, ?reason, "Remote hangup");
                        break;
                    }
                    Ok(MediaEvent::Clear | MediaEvent::Transfer { .. }) => {
                        debug!(%call_id, "Ignoring server-only event from client");
                    }
                    Err(e) => warn!(%call_id, error = %e, "Invalid media event"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%call_id, "Media socket closed by client");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%call_id, error = %e, "Media socket error");
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Audio(data)) => {
                    if ws_tx.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Clear) => {
                    if let Some(msg) = event_message(&MediaEvent::Clear) {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Outbound::Transfer(to)) => {
                    if let Some(msg) = event_message(&MediaEvent::Transfer { to }) {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Outbound::Hangup(reason)) => {
                    if let Some(msg) = event_message(&MediaEvent::Hangup { reason: Some(reason) }) {
                        let _ = ws_tx.send(msg).await;
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                // The call dropped its sink: it is over.
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    let _ = events_tx.try_send(TransportEvent::Hangup);
    info!(%call_id, "Media socket finished");
}
