//! Outbound audio queue and the writer task that feeds the transport.
//!
//! The queue is bounded and ordered. Stale chunks are purged instead of
//! blocking producers, and the writer checks the turn gate once more right
//! before each chunk reaches the transport, so nothing from a lost turn is
//! ever played.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use rusty_dial_core::error::AdapterError;
use rusty_dial_core::types::TaggedChunk;
use rusty_dial_providers::AudioSink;

use crate::arbiter::TurnGate;
use crate::pcm_duration;

/// How far ahead of real time the writer may push audio to the transport.
const PLAYOUT_LEAD: Duration = Duration::from_millis(200);

#[derive(Debug)]
enum OutboundItem {
    Audio(TaggedChunk),
    EndOfTurn(u64),
    Clear,
}

/// Reported by the writer task.
#[derive(Debug)]
pub enum PlayoutEvent {
    /// Every chunk of the turn has been played out.
    Drained(u64),
    /// The transport rejected audio.
    Failed(AdapterError),
}

struct Shared {
    queue: Mutex<VecDeque<OutboundItem>>,
    notify: Notify,
    closed: AtomicBool,
}

pub struct OutboundQueue {
    shared: Arc<Shared>,
    gate: TurnGate,
    capacity: usize,
}

impl OutboundQueue {
    /// Create the queue and start its writer.
    pub fn spawn(
        sink: Arc<dyn AudioSink>,
        gate: TurnGate,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<PlayoutEvent>, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(shared.clone(), sink, gate.clone(), events_tx, cancel));
        let queue = Self {
            shared,
            gate,
            capacity: capacity.max(1),
        };
        (queue, events_rx, writer)
    }

    /// Room for at least one more chunk, after purging stale ones.
    pub fn has_capacity(&self) -> bool {
        let mut queue = self.lock();
        purge_stale(&mut queue, &self.gate);
        audio_len(&queue) < self.capacity
    }

    /// Queue a chunk. Hands the chunk back when the queue is full of current
    /// audio.
    pub fn push(&self, chunk: TaggedChunk) -> Result<(), TaggedChunk> {
        let mut queue = self.lock();
        if audio_len(&queue) >= self.capacity {
            purge_stale(&mut queue, &self.gate);
            if audio_len(&queue) >= self.capacity {
                return Err(chunk);
            }
        }
        queue.push_back(OutboundItem::Audio(chunk));
        drop(queue);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Mark the end of a turn's audio; the writer reports
    /// [`PlayoutEvent::Drained`] once everything before it has played.
    pub fn end_of_turn(&self, seq: u64) {
        self.lock().push_back(OutboundItem::EndOfTurn(seq));
        self.shared.notify.notify_one();
    }

    /// Barge-in: drop stale audio and tell the transport to flush its buffer.
    /// Returns how many queued chunks were discarded.
    pub fn interrupt(&self) -> usize {
        let mut queue = self.lock();
        let dropped = purge_stale(&mut queue, &self.gate);
        queue.push_front(OutboundItem::Clear);
        drop(queue);
        self.shared.notify.notify_one();
        dropped
    }

    /// Queued audio chunks.
    pub fn len(&self) -> usize {
        audio_len(&self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the writer once the queue is empty.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OutboundItem>> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn audio_len(queue: &VecDeque<OutboundItem>) -> usize {
    queue
        .iter()
        .filter(|item| matches!(item, OutboundItem::Audio(_)))
        .count()
}

fn purge_stale(queue: &mut VecDeque<OutboundItem>, gate: &TurnGate) -> usize {
    let current = gate.current();
    let before = queue.len();
    queue.retain(|item| match item {
        OutboundItem::Audio(chunk) => chunk.seq == current,
        OutboundItem::EndOfTurn(seq) => *seq == current,
        OutboundItem::Clear => true,
    });
    let dropped = before - queue.len();
    if dropped > 0 {
        debug!(dropped, seq = current, "Purged stale outbound audio");
    }
    dropped
}

async fn write_loop(
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    gate: TurnGate,
    events: mpsc::UnboundedSender<PlayoutEvent>,
    cancel: CancellationToken,
) {
    // Wall-clock time at which everything sent so far finishes playing.
    let mut played_until = Instant::now();

    loop {
        let item = loop {
            let next = shared.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            if let Some(item) = next {
                break item;
            }
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shared.notify.notified() => {}
            }
        };

        match item {
            OutboundItem::Audio(chunk) => {
                if !gate.is_current(chunk.seq) {
                    trace!(seq = chunk.seq, index = chunk.index, "Dropped stale chunk at transport boundary");
                    continue;
                }
                let length = pcm_duration(chunk.data.len());
                if let Err(e) = sink.send_audio(chunk).await {
                    warn!(error = %e, "Transport rejected audio");
                    let _ = events.send(PlayoutEvent::Failed(e));
                    return;
                }
                let now = Instant::now();
                played_until = played_until.max(now) + length;
                if played_until > now + PLAYOUT_LEAD {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep_until(played_until - PLAYOUT_LEAD) => {}
                    }
                }
            }
            OutboundItem::EndOfTurn(seq) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(played_until) => {}
                }
                if gate.is_current(seq) {
                    let _ = events.send(PlayoutEvent::Drained(seq));
                }
            }
            OutboundItem::Clear => {
                played_until = Instant::now();
                if let Err(e) = sink.clear().await {
                    warn!(error = %e, "Failed to clear transport audio");
                }
            }
        }
    }
}
