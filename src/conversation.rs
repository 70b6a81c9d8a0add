//! Ordered turn history handed to the reasoning model.
//!
//! The task is held outside the turn list and is never pruned. A turn is
//! "consumed" once a [`Conversation::snapshot`] containing it has been taken
//! for a model request; only consumed turns outside the recent window may be
//! elided or dropped.

use crate::action::{ActionResult, Observation, ProposedCall};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const ELIDED_FRAME: &str = "[screenshot elided]";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("turn {turn}: {calls} proposed calls but {results} results")]
    Dangling { turn: u64, calls: usize, results: usize },
    #[error("turn {turn}: result {position} answers '{got}', expected '{expected}'")]
    Mismatched { turn: u64, position: usize, expected: String, got: String },
    #[error("turn {got} appended out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("history bound of {max_turns} turns cannot be met without dropping unconsumed results")]
    Saturated { max_turns: usize },
    #[error("turn {turn} cannot be measured: {reason}")]
    Unmeasurable { turn: u64, reason: String },
}

/// One model proposal and the results of every call in it, in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub narration: Option<String>,
    pub calls: Vec<ProposedCall>,
    pub results: Vec<ActionResult>,
}

impl Turn {
    /// Pairs calls with results; every call must have exactly one result in
    /// the same position.
    pub fn new(
        index: u64,
        narration: Option<String>,
        calls: Vec<ProposedCall>,
        results: Vec<ActionResult>,
    ) -> Result<Self, ConversationError> {
        if calls.len() != results.len() {
            return Err(ConversationError::Dangling { turn: index, calls: calls.len(), results: results.len() });
        }
        for (position, (call, result)) in calls.iter().zip(&results).enumerate() {
            if call.id != result.call_id {
                return Err(ConversationError::Mismatched {
                    turn: index,
                    position,
                    expected: call.id.clone(),
                    got: result.call_id.clone(),
                });
            }
        }
        Ok(Self { index, narration, calls, results })
    }

    /// Serialized size, the unit of the byte budget.
    pub fn byte_size(&self) -> Result<usize, ConversationError> {
        serde_json::to_vec(self)
            .map(|v| v.len())
            .map_err(|e| ConversationError::Unmeasurable { turn: self.index, reason: e.to_string() })
    }

    fn has_frames(&self) -> bool {
        self.results.iter().any(|r| matches!(r.observation, Observation::Frame { .. }))
    }

    fn elide_frames(&mut self) {
        for r in &mut self.results {
            if let Observation::Frame { note, .. } = &r.observation {
                let text = match note {
                    Some(n) => format!("{n} {ELIDED_FRAME}"),
                    None => ELIDED_FRAME.to_string(),
                };
                r.observation = Observation::Output { text };
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBounds {
    pub max_turns: usize,
    /// Serialized size budget. Turns in the recent window are exempt.
    pub max_bytes: usize,
    /// Most recent turns that are always retained verbatim.
    pub keep_recent: usize,
}

impl Default for HistoryBounds {
    fn default() -> Self {
        Self { max_turns: 40, max_bytes: 8 * 1024 * 1024, keep_recent: 6 }
    }
}

#[derive(Debug)]
pub struct Conversation {
    task: String,
    turns: Vec<Turn>,
    /// Serialized size of each turn, parallel to `turns`.
    sizes: Vec<usize>,
    total_bytes: usize,
    bounds: HistoryBounds,
    next_index: u64,
    /// Turns with an index below this have been sent to the model.
    consumed_below: u64,
    pruned: u64,
}

impl Conversation {
    pub fn new(task: impl Into<String>, bounds: HistoryBounds) -> Self {
        Self {
            task: task.into(),
            turns: Vec::new(),
            sizes: Vec::new(),
            total_bytes: 0,
            bounds,
            next_index: 0,
            consumed_below: 0,
            pruned: 0,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns dropped so far.
    pub fn pruned(&self) -> u64 {
        self.pruned
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn append(&mut self, turn: Turn) -> Result<(), ConversationError> {
        if turn.index != self.next_index {
            return Err(ConversationError::OutOfOrder { expected: self.next_index, got: turn.index });
        }
        let size = turn.byte_size()?;
        self.turns.push(turn);
        self.sizes.push(size);
        self.total_bytes += size;
        self.prune()?;
        if self.turns.len() > self.bounds.max_turns {
            self.turns.pop();
            if let Some(size) = self.sizes.pop() {
                self.total_bytes -= size;
            }
            return Err(ConversationError::Saturated { max_turns: self.bounds.max_turns });
        }
        self.next_index += 1;
        Ok(())
    }

    /// Ordered view for the next model request. Everything returned counts
    /// as consumed from here on.
    pub fn snapshot(&mut self) -> &[Turn] {
        self.consumed_below = self.next_index;
        &self.turns
    }

    fn prunable(&self, position: usize) -> bool {
        let protected_from = self.turns.len().saturating_sub(self.bounds.keep_recent);
        position < protected_from && self.turns[position].index < self.consumed_below
    }

    fn prune(&mut self) -> Result<(), ConversationError> {
        if self.total_bytes > self.bounds.max_bytes {
            for position in 0..self.turns.len() {
                if !self.prunable(position) || !self.turns[position].has_frames() {
                    continue;
                }
                let turn = &mut self.turns[position];
                turn.elide_frames();
                let size = turn.byte_size()?;
                self.total_bytes = self.total_bytes - self.sizes[position] + size;
                self.sizes[position] = size;
                debug!(turn = turn.index, bytes = size, "elided frames from history");
                if self.total_bytes <= self.bounds.max_bytes {
                    break;
                }
            }
        }
        while (self.turns.len() > self.bounds.max_turns || self.total_bytes > self.bounds.max_bytes)
            && !self.turns.is_empty()
            && self.prunable(0)
        {
            let dropped = self.turns.remove(0);
            self.total_bytes -= self.sizes.remove(0);
            self.pruned += 1;
            debug!(turn = dropped.index, "pruned turn from history");
        }
        Ok(())
    }
}
