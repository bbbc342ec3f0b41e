//! # Routing: who answers the next input
//!
//! Two interchangeable strategies sit behind the [`Router`] trait:
//!
//! - [`ModelRouter`] (AI-driven): the active agent embeds its routing
//!   decision in its own output as a handoff call; the router only checks
//!   that the requested target is among the source agent's allowed targets.
//! - [`PhaseRouter`] (rule-driven): the target is a function of the derived
//!   phase alone, ignoring agent output entirely; used for pre-programmed
//!   sequencing.
//!
//! The execution loop depends only on `select_next` (and `entry` for the
//! first agent of a submission); strategies are chosen at ensemble
//! construction and never inspected at runtime.

use std::collections::{BTreeSet, HashMap};

use crate::agent::AgentDef;
use crate::context::ContextSnapshot;
use crate::error::{EnsembleError, Result};
use crate::items::ModelResponse;
use crate::phase::{Phase, PhaseSchedule};

/// Decides which agent handles the conversation next.
pub trait Router: Send + Sync {
    /// Resolves the next agent from a context snapshot and the source
    /// agent's output. `None` means the active agent keeps control.
    fn select_next(
        &self,
        snapshot: &ContextSnapshot,
        source: &AgentDef,
        output: &ModelResponse,
    ) -> Result<Option<String>>;

    /// The agent that should open a submission, if the strategy knows one.
    fn entry(&self, _snapshot: &ContextSnapshot) -> Option<String> {
        None
    }
}

/// AI-driven router: reads the handoff request out of the agent's output.
///
/// A tool call whose name matches a registered agent is a handoff request.
/// The router validates the request against the source's allowed targets; a
/// request for a disallowed or unknown agent is a routing error.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    known_agents: BTreeSet<String>,
}

impl ModelRouter {
    pub fn new(known_agents: BTreeSet<String>) -> Self {
        Self { known_agents }
    }
}

impl Router for ModelRouter {
    fn select_next(
        &self,
        _snapshot: &ContextSnapshot,
        source: &AgentDef,
        output: &ModelResponse,
    ) -> Result<Option<String>> {
        let requested = output
            .tool_calls
            .iter()
            .find(|call| self.known_agents.contains(&call.name));

        match requested {
            None => Ok(None),
            Some(call) if source.may_hand_off_to(&call.name) => Ok(Some(call.name.clone())),
            Some(call) => Err(EnsembleError::routing(format!(
                "agent '{}' requested handoff to '{}', which is not an allowed target",
                source.name(),
                call.name
            ))),
        }
    }
}

/// Rule-driven router: maps the derived phase to an agent.
///
/// The mapping must cover every phase of the schedule; construction fails
/// otherwise, and a phase that still resolves to nothing at routing time is
/// a routing error.
#[derive(Debug, Clone)]
pub struct PhaseRouter {
    schedule: PhaseSchedule,
    by_phase: HashMap<String, String>,
}

impl PhaseRouter {
    pub fn new(
        schedule: PhaseSchedule,
        assignments: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let by_phase: HashMap<String, String> = assignments.into_iter().collect();
        for spec in schedule.specs() {
            if !by_phase.contains_key(&spec.name) {
                return Err(EnsembleError::routing(format!(
                    "no agent assigned to phase '{}'",
                    spec.name
                )));
            }
        }
        Ok(Self { schedule, by_phase })
    }

    fn agent_for_current_phase(&self, snapshot: &ContextSnapshot) -> Result<Option<String>> {
        match snapshot.phase(&self.schedule) {
            Phase::Terminal => Ok(None),
            Phase::Active { name, .. } => self
                .by_phase
                .get(&name)
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    EnsembleError::routing(format!("no agent assigned to phase '{}'", name))
                }),
        }
    }
}

impl Router for PhaseRouter {
    fn select_next(
        &self,
        snapshot: &ContextSnapshot,
        _source: &AgentDef,
        _output: &ModelResponse,
    ) -> Result<Option<String>> {
        self.agent_for_current_phase(snapshot)
    }

    fn entry(&self, snapshot: &ContextSnapshot) -> Option<String> {
        self.agent_for_current_phase(snapshot).ok().flatten()
    }
}
