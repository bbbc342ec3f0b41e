//! # Shared session state
//!
//! [`SharedContext`] is the single mutable state object of a session: the
//! canonical conversation history, a metadata map, and the per-phase turn
//! counters. It is owned exclusively by one session for the session's
//! lifetime. Agents, instruction functions, and routers never touch it
//! directly; they receive a read-only [`ContextSnapshot`].
//!
//! All mutation goes through [`SharedContext::apply`] with a [`TurnDelta`]:
//! the execution loop builds up the delta over a turn and commits it in one
//! call, so the context only ever moves between fully committed turn
//! boundaries. An aborted or failed turn simply drops its delta.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::items::Message;
use crate::phase::{Phase, PhaseSchedule};

/// Mutable session state: history, metadata, and phase counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedContext {
    history: Vec<Message>,
    metadata: HashMap<String, Value>,
    counters: BTreeMap<String, u64>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical conversation history, in insertion order.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    /// The current phase, recomputed from counters on every call.
    pub fn phase(&self, schedule: &PhaseSchedule) -> Phase {
        schedule.phase_of(&self.counters)
    }

    /// Produces a read-only snapshot with the canonical history.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            history: self.history.clone(),
            metadata: self.metadata.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Produces a snapshot whose history is the given working transcript.
    ///
    /// Used by the execution loop mid-turn, where the transcript holds the
    /// committed history plus the in-flight items of the current submission.
    pub fn snapshot_with_transcript(&self, transcript: Vec<Message>) -> ContextSnapshot {
        ContextSnapshot {
            history: transcript,
            metadata: self.metadata.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Commits a completed turn in one step.
    ///
    /// Appends the delta's messages in order, bumps the attributed phase
    /// counter by exactly one, and merges metadata entries. Counters only
    /// ever increase.
    pub fn apply(&mut self, delta: TurnDelta) {
        self.history.extend(delta.messages);
        if let Some(phase) = delta.counter {
            *self.counters.entry(phase).or_insert(0) += 1;
        }
        for (key, value) in delta.metadata {
            self.metadata.insert(key, value);
        }
    }
}

/// Read-only view of a [`SharedContext`] handed to agents and routers.
///
/// `history` is the transcript the agent should see; mid-turn it includes
/// the in-flight items of the current submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub history: Vec<Message>,
    pub metadata: HashMap<String, Value>,
    pub counters: BTreeMap<String, u64>,
}

impl ContextSnapshot {
    pub fn phase(&self, schedule: &PhaseSchedule) -> Phase {
        schedule.phase_of(&self.counters)
    }

    /// Renders the transcript as plain `role: content` lines, the shape
    /// instruction functions typically embed in their prompt.
    pub fn transcript_text(&self) -> String {
        self.history
            .iter()
            .map(|m| {
                let role = match m.role {
                    crate::items::Role::System => "system",
                    crate::items::Role::User => "user",
                    crate::items::Role::Assistant => "assistant",
                    crate::items::Role::Tool => "tool",
                };
                format!("{}: {}", role, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pure function deriving metadata entries from a finished exchange.
///
/// Hooks run after the active agent produces its final answer; the snapshot
/// they receive is the turn's working transcript with that answer appended.
/// Returned entries join the turn's [`TurnDelta`] and commit with it, so all
/// metadata still flows through the loop's single writer. This is how a
/// session tracks derived slots like the conversation topic or the user's
/// knowledge level without giving agents a write path.
pub type MetadataHook = Arc<dyn Fn(&ContextSnapshot) -> Vec<(String, Value)> + Send + Sync>;

/// The mutation of one completed turn, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct TurnDelta {
    messages: Vec<Message>,
    counter: Option<String>,
    metadata: Vec<(String, Value)>,
}

impl TurnDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Attributes the turn to the given phase; its counter increments by one
    /// on commit.
    pub fn attribute_to(&mut self, phase: impl Into<String>) {
        self.counter = Some(phase.into());
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.push((key.into(), value));
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.counter.is_none() && self.metadata.is_empty()
    }
}
