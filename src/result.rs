//! Result types for a submission

use serde::{Deserialize, Serialize};

use crate::items::TurnEvent;
use crate::provider::Usage;

/// Why a submission stopped without a final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The turn counter would have exceeded the configured bound.
    TurnLimitExceeded { max_turns: usize },
    /// The per-turn timeout expired.
    Timeout,
    /// Every phase of the schedule is exhausted; no further turns are issued.
    PhaseComplete,
    /// The session was cancelled while the submission was in flight.
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::TurnLimitExceeded { max_turns } => {
                write!(f, "turn limit exceeded: {}", max_turns)
            }
            AbortReason::Timeout => write!(f, "turn timed out"),
            AbortReason::PhaseComplete => write!(f, "all phases complete"),
            AbortReason::Cancelled => write!(f, "session cancelled"),
        }
    }
}

/// Terminal outcome of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TurnOutcome {
    /// The active agent produced a final answer; the turn was committed.
    Final(String),
    /// The submission stopped without committing a turn.
    Aborted(AbortReason),
}

/// The result of running one submission through the execution loop.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: TurnOutcome,
    /// Which agent held control when the submission ended.
    pub final_agent: String,
    /// Diagnostic trace of the submission, in event order.
    pub events: Vec<TurnEvent>,
    /// Aggregate provider usage across the submission's turns.
    pub usage: Usage,
}

impl RunResult {
    pub fn is_final(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Final(_))
    }

    pub fn final_text(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Final(text) => Some(text),
            TurnOutcome::Aborted(_) => None,
        }
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.outcome {
            TurnOutcome::Aborted(reason) => Some(reason),
            TurnOutcome::Final(_) => None,
        }
    }

    /// Failed tool attempts recorded in the diagnostic trace.
    pub fn tool_error_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_tool_error()).count()
    }
}
