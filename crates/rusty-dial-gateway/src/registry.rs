//! Process-wide table of live calls.
//!
//! Admission (capacity check, id allocation, launch, insert) happens under a
//! single lock, so the ceiling can never be overshot by concurrent opens.
//! The lock is a `std::sync::Mutex` and is never held across an `.await`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rusty_dial_core::config::{CallSettings, CallsConfig};
use rusty_dial_core::error::{Result, RustyDialError};
use rusty_dial_core::history::ConversationHistory;
use rusty_dial_core::types::{CallId, CallInfo, CallState, Direction, EndReason};
use rusty_dial_media::call::{CallHandle, CallRecord};

use crate::callbacks::CallbackNotifier;

/// Ended call ids remembered after their archive entry is evicted, so late
/// hangups stay idempotent.
const ENDED_IDS: usize = 10_000;

/// Admission and lifetime limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_concurrent: usize,
    pub max_duration: Duration,
    pub archive_size: usize,
}

impl RegistryLimits {
    /// Ceiling and archive from `calls`; the duration limit from the
    /// validated per-call settings.
    pub fn new(calls: &CallsConfig, settings: &CallSettings) -> Self {
        Self {
            max_concurrent: calls.max_concurrent,
            max_duration: settings.max_duration,
            archive_size: calls.archive_size,
        }
    }
}

/// Who is on the call and since when.
#[derive(Debug, Clone)]
struct CallMeta {
    call_id: CallId,
    direction: Direction,
    from: String,
    to: String,
    started_at: DateTime<Utc>,
    opened: Instant,
}

struct LiveCall {
    meta: CallMeta,
    handle: CallHandle,
    /// Set once the sweeper has asked the call to end.
    expired: bool,
}

struct ArchivedCall {
    meta: CallMeta,
    record: CallRecord,
}

#[derive(Default)]
struct Tables {
    live: HashMap<CallId, LiveCall>,
    archive: VecDeque<ArchivedCall>,
    ended: HashSet<CallId>,
    ended_order: VecDeque<CallId>,
}

impl Tables {
    fn remember_ended(&mut self, call_id: CallId, keep: usize) {
        if self.ended.insert(call_id) {
            self.ended_order.push_back(call_id);
        }
        while self.ended_order.len() > keep {
            if let Some(old) = self.ended_order.pop_front() {
                self.ended.remove(&old);
            }
        }
    }
}

/// Status plus conversation of a live or archived call.
#[derive(Debug, Clone)]
pub struct CallView {
    pub info: CallInfo,
    pub history: Arc<ConversationHistory>,
}

pub struct CallRegistry {
    limits: RegistryLimits,
    tables: Mutex<Tables>,
    callbacks: CallbackNotifier,
}

impl CallRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            tables: Mutex::new(Tables::default()),
            callbacks: CallbackNotifier::disabled(),
        }
    }

    /// Report `incoming_call` and `call_ended` through `callbacks`.
    pub fn with_callbacks(mut self, callbacks: CallbackNotifier) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call and start it with `launch`. Fails fast at the ceiling
    /// without calling `launch`.
    ///
    /// A supervisor task moves the call to the archive once it ends.
    pub fn open<F>(self: &Arc<Self>, direction: Direction, from: &str, to: &str, launch: F) -> Result<CallHandle>
    where
        F: FnOnce(CallId) -> (CallHandle, JoinHandle<CallRecord>),
    {
        let (handle, task) = {
            let mut tables = self.lock();
            let live = tables.live.len();
            if live >= self.limits.max_concurrent {
                drop(tables);
                warn!(live, ceiling = self.limits.max_concurrent, ?direction, "Call rejected: at capacity");
                #[cfg(feature = "metrics")]
                crate::metrics::record_call_rejected("capacity_exceeded");
                return Err(RustyDialError::CapacityExceeded {
                    live,
                    ceiling: self.limits.max_concurrent,
                });
            }

            let call_id = CallId::new();
            let (handle, task) = launch(call_id);
            tables.live.insert(
                call_id,
                LiveCall {
                    meta: CallMeta {
                        call_id,
                        direction,
                        from: from.to_string(),
                        to: to.to_string(),
                        started_at: Utc::now(),
                        opened: Instant::now(),
                    },
                    handle: handle.clone(),
                    expired: false,
                },
            );
            (handle, task)
        };

        let call_id = handle.call_id();
        info!(%call_id, ?direction, "Call opened");
        #[cfg(feature = "metrics")]
        crate::metrics::record_call_opened(direction);
        if direction == Direction::Inbound {
            self.callbacks.incoming_call(call_id, from, to);
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let record = match task.await {
                Ok(record) => record,
                Err(e) => {
                    error!(%call_id, error = %e, "Call task failed");
                    CallRecord {
                        call_id,
                        end_reason: EndReason::AdapterFatal {
                            adapter: "runtime".into(),
                            message: e.to_string(),
                        },
                        turn_count: 0,
                        duration_ms: 0,
                        history: Arc::new(ConversationHistory::new()),
                        transitions: Vec::new(),
                    }
                }
            };
            registry.finish(record);
        });

        Ok(handle)
    }

    /// Ask a call to end. Idempotent: ending an ended call succeeds.
    pub async fn close(&self, call_id: CallId, reason: EndReason) -> Result<()> {
        let handle = {
            let tables = self.lock();
            match tables.live.get(&call_id) {
                Some(entry) => entry.handle.clone(),
                None if tables.ended.contains(&call_id) => return Ok(()),
                None => return Err(RustyDialError::CallNotFound(call_id)),
            }
        };
        match handle.end(reason).await {
            Ok(()) | Err(RustyDialError::CallEnded(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Handle of a live call.
    pub fn get(&self, call_id: CallId) -> Result<CallHandle> {
        let tables = self.lock();
        match tables.live.get(&call_id) {
            Some(entry) => Ok(entry.handle.clone()),
            None if tables.ended.contains(&call_id) => Err(RustyDialError::CallEnded(call_id)),
            None => Err(RustyDialError::CallNotFound(call_id)),
        }
    }

    /// Live or archived call, most recent archive entry first.
    pub fn lookup(&self, call_id: CallId) -> Option<CallView> {
        let tables = self.lock();
        if let Some(entry) = tables.live.get(&call_id) {
            return Some(live_view(entry));
        }
        tables
            .archive
            .iter()
            .rev()
            .find(|a| a.meta.call_id == call_id)
            .map(archived_view)
    }

    /// Live calls, oldest first.
    pub fn list(&self) -> Vec<CallInfo> {
        let tables = self.lock();
        let mut calls: Vec<CallInfo> = tables.live.values().map(|entry| live_view(entry).info).collect();
        calls.sort_by_key(|c| c.started_at);
        calls
    }

    /// Ended calls still held in the archive, oldest first.
    pub fn archived(&self) -> Vec<CallInfo> {
        self.lock().archive.iter().map(|a| archived_view(a).info).collect()
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Move an ended call from the live table to the archive.
    fn finish(&self, record: CallRecord) {
        let call_id = record.call_id;
        let mut tables = self.lock();
        let Some(entry) = tables.live.remove(&call_id) else {
            debug!(%call_id, "Finished call was not live");
            return;
        };
        info!(
            %call_id,
            reason = record.end_reason.code(),
            turns = record.turn_count,
            duration_ms = record.duration_ms,
            live = tables.live.len(),
            "Call closed"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_call_ended(&record);
        self.callbacks
            .call_ended(call_id, &record.end_reason, record.duration_ms / 1000);

        let keep = ENDED_IDS.max(self.limits.archive_size);
        tables.remember_ended(call_id, keep);
        tables.archive.push_back(ArchivedCall {
            meta: entry.meta,
            record,
        });
        while tables.archive.len() > self.limits.archive_size {
            tables.archive.pop_front();
        }
    }

    /// Calls past the maximum duration that have not been told to end yet.
    fn expired(&self) -> Vec<(CallId, CallHandle)> {
        let mut tables = self.lock();
        let max = self.limits.max_duration;
        tables
            .live
            .values_mut()
            .filter(|entry| !entry.expired && entry.meta.opened.elapsed() >= max)
            .map(|entry| {
                entry.expired = true;
                (entry.meta.call_id, entry.handle.clone())
            })
            .collect()
    }

    /// End every call past the maximum duration, whatever its turn state.
    /// Returns how many calls were told to end.
    pub async fn sweep(&self) -> usize {
        let expired = self.expired();
        for (call_id, handle) in &expired {
            warn!(%call_id, max_secs = self.limits.max_duration.as_secs(), "Call exceeded maximum duration");
            if let Err(e) = handle.end(EndReason::MaxDurationExceeded).await {
                debug!(%call_id, error = %e, "Expired call already ending");
            }
        }
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            debug!("Duration sweeper stopped");
        })
    }

    /// End every live call and wait (up to `timeout`) for them to archive.
    pub async fn shutdown(&self, timeout: Duration) {
        let handles: Vec<CallHandle> = self.lock().live.values().map(|e| e.handle.clone()).collect();
        if handles.is_empty() {
            return;
        }
        info!(calls = handles.len(), "Ending live calls for shutdown");
        for handle in handles {
            let _ = handle.end(EndReason::Shutdown).await;
        }
        let deadline = Instant::now() + timeout;
        while self.live_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let left = self.live_count();
        if left > 0 {
            warn!(left, "Calls still live after shutdown timeout");
        }
    }
}

fn live_view(entry: &LiveCall) -> CallView {
    let snapshot = entry.handle.snapshot();
    CallView {
        info: CallInfo {
            call_id: entry.meta.call_id,
            direction: entry.meta.direction,
            from: entry.meta.from.clone(),
            to: entry.meta.to.clone(),
            state: snapshot.state,
            turn_count: snapshot.turn_count,
            started_at: entry.meta.started_at,
            elapsed_secs: entry.meta.opened.elapsed().as_secs(),
            end_reason: snapshot.end_reason,
        },
        history: snapshot.history,
    }
}

fn archived_view(archived: &ArchivedCall) -> CallView {
    CallView {
        info: CallInfo {
            call_id: archived.meta.call_id,
            direction: archived.meta.direction,
            from: archived.meta.from.clone(),
            to: archived.meta.to.clone(),
            state: CallState::Ended,
            turn_count: archived.record.turn_count,
            started_at: archived.meta.started_at,
            elapsed_secs: archived.record.duration_ms / 1000,
            end_reason: Some(archived.record.end_reason.clone()),
        },
        history: archived.record.history.clone(),
    }
}
