//! Turn-taking state machine.
//!
//! One arbiter per call decides who holds the floor. Every holder change
//! bumps the turn sequence number; results tagged with an older number are
//! stale and get discarded wherever they surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rusty_dial_core::error::{Result, RustyDialError};
use rusty_dial_core::types::{CallId, CallState, EndReason, Turn, TurnHolder};

/// Shared view of the current turn sequence, read by the outbound writer right
/// before each chunk reaches the transport.
#[derive(Debug, Clone, Default)]
pub struct TurnGate(Arc<AtomicU64>);

impl TurnGate {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_current(&self, seq: u64) -> bool {
        self.current() == seq
    }

    fn set(&self, seq: u64) {
        self.0.store(seq, Ordering::Release);
    }
}

/// Issued when the agent takes the floor. Work done for the turn carries
/// `seq`; `cancel` fires when the turn is lost.
#[derive(Debug, Clone)]
pub struct TurnTicket {
    pub seq: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
    pub seq: u64,
    pub at_ms: u64,
}

#[derive(Debug)]
pub struct TurnArbiter {
    call_id: CallId,
    state: CallState,
    turn: Turn,
    gate: TurnGate,
    cancel: CancellationToken,
    agent_turns: u64,
    end_reason: Option<EndReason>,
    transitions: Vec<Transition>,
}

impl TurnArbiter {
    pub fn new(call_id: CallId, gate: TurnGate) -> Self {
        gate.set(0);
        Self {
            call_id,
            state: CallState::Idle,
            turn: Turn {
                holder: TurnHolder::None,
                acquired_at_ms: 0,
                seq: 0,
            },
            gate,
            cancel: CancellationToken::new(),
            agent_turns: 0,
            end_reason: None,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn turn(&self) -> Turn {
        self.turn
    }

    pub fn seq(&self) -> u64 {
        self.turn.seq
    }

    pub fn agent_turns(&self) -> u64 {
        self.agent_turns
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// True while `seq` names the agent turn that currently holds the floor.
    pub fn is_current(&self, seq: u64) -> bool {
        self.turn.seq == seq && self.turn.holder == TurnHolder::Agent
    }

    /// Caller audio or transcript arrived. Idle and interrupted calls move to
    /// listening; while the agent holds the floor this is a no-op (barge-in is
    /// a separate decision).
    pub fn caller_activity(&mut self, now_ms: u64) -> Result<bool> {
        self.ensure_live()?;
        match self.state {
            CallState::Idle => {
                self.transition(CallState::Listening, now_ms);
                Ok(true)
            }
            CallState::Interrupted => {
                self.transition(CallState::Listening, now_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The agent takes the floor, either to answer a finalized utterance or
    /// to speak on its own initiative.
    pub fn begin_agent_turn(&mut self, now_ms: u64) -> Result<TurnTicket> {
        self.ensure_live()?;
        match self.state {
            CallState::Idle | CallState::Listening | CallState::Interrupted => {
                self.cancel = CancellationToken::new();
                self.agent_turns += 1;
                self.transition(CallState::Thinking, now_ms);
                Ok(TurnTicket {
                    seq: self.turn.seq,
                    cancel: self.cancel.clone(),
                })
            }
            other => Err(RustyDialError::Other(anyhow::anyhow!(
                "cannot start an agent turn while {other}"
            ))),
        }
    }

    /// First audio of the turn is about to play.
    pub fn first_audio(&mut self, seq: u64, now_ms: u64) -> Result<bool> {
        self.ensure_current(seq)?;
        if self.state == CallState::Thinking {
            self.transition(CallState::Speaking, now_ms);
            return Ok(true);
        }
        Ok(false)
    }

    /// The agent turn is over: either its audio drained or it produced
    /// nothing to say.
    pub fn agent_finished(&mut self, seq: u64, now_ms: u64) -> Result<()> {
        self.ensure_current(seq)?;
        self.transition(CallState::Idle, now_ms);
        Ok(())
    }

    /// Caller speech confirmed while the agent holds the floor. Cancels the
    /// agent turn and returns the sequence number that just became stale.
    pub fn barge_in(&mut self, now_ms: u64) -> Option<u64> {
        if !matches!(self.state, CallState::Thinking | CallState::Speaking) {
            return None;
        }
        let stale = self.turn.seq;
        self.cancel.cancel();
        self.transition(CallState::Interrupted, now_ms);
        info!(call_id = %self.call_id, stale_seq = stale, seq = self.turn.seq, "Caller barged in");
        Some(stale)
    }

    /// Move to the terminal state. Returns false when the call had already
    /// ended; the first reason wins.
    pub fn end(&mut self, reason: EndReason, now_ms: u64) -> bool {
        if self.is_ended() {
            return false;
        }
        self.cancel.cancel();
        self.end_reason = Some(reason);
        self.transition(CallState::Ended, now_ms);
        true
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_ended() {
            return Err(RustyDialError::CallEnded(self.call_id));
        }
        Ok(())
    }

    fn ensure_current(&self, seq: u64) -> Result<()> {
        self.ensure_live()?;
        if !self.is_current(seq) {
            return Err(RustyDialError::StaleResult {
                got: seq,
                current: self.turn.seq,
            });
        }
        Ok(())
    }

    fn transition(&mut self, to: CallState, now_ms: u64) {
        let from = self.state;
        let holder = to.holder();
        // Barge-in and end always invalidate outstanding work, even when the
        // holder stays the same.
        if holder != self.turn.holder || matches!(to, CallState::Interrupted | CallState::Ended) {
            self.turn = Turn {
                holder,
                acquired_at_ms: now_ms,
                seq: self.turn.seq + 1,
            };
            self.gate.set(self.turn.seq);
        }
        self.state = to;
        self.transitions.push(Transition {
            from,
            to,
            seq: self.turn.seq,
            at_ms: now_ms,
        });
        debug!(call_id = %self.call_id, %from, %to, seq = self.turn.seq, "Call state transition");
    }
}
