//! # Agent definitions
//!
//! An [`AgentDef`] describes a configured participant in a session: a name,
//! an instruction function, the set of agents it may hand off to, the tool
//! capabilities it may invoke, and the phase it belongs to. Definitions are
//! registered once and shared immutably; per-turn state lives in the
//! session's shared context, never in the agent.
//!
//! Instructions are produced by a pure function of a context snapshot and
//! the agent's own name. This is what lets an agent's prompt embed the live
//! conversation without the agent holding any state of its own:
//!
//! ```rust
//! use ensemble::agent::AgentDef;
//!
//! let agent = AgentDef::new("Asistente Español", |snapshot, _name| {
//!     format!(
//!         "Responde SIEMPRE en español.\n\nHistoria de la conversación:\n{}",
//!         snapshot.transcript_text()
//!     )
//! })
//! .with_tool("get_weather")
//! .with_phase("spanish");
//!
//! assert_eq!(agent.name(), "Asistente Español");
//! assert!(agent.tool_set().contains("get_weather"));
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::ContextSnapshot;

/// Pure instruction generator: context snapshot + agent name in, system
/// instruction text out. Implementations must not capture mutable state.
pub type InstructionFn = Arc<dyn Fn(&ContextSnapshot, &str) -> String + Send + Sync>;

/// Immutable definition of one agent.
#[derive(Clone)]
pub struct AgentDef {
    name: String,
    instructions: InstructionFn,
    handoff_description: Option<String>,
    allowed_targets: BTreeSet<String>,
    tool_set: BTreeSet<String>,
    phase: Option<String>,
}

impl AgentDef {
    /// Creates an agent with a dynamic instruction function.
    pub fn new<F>(name: impl Into<String>, instructions: F) -> Self
    where
        F: Fn(&ContextSnapshot, &str) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            instructions: Arc::new(instructions),
            handoff_description: None,
            allowed_targets: BTreeSet::new(),
            tool_set: BTreeSet::new(),
            phase: None,
        }
    }

    /// Creates an agent whose instructions do not depend on context.
    pub fn with_static_instructions(
        name: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        let text = instructions.into();
        Self::new(name, move |_snapshot, _agent| text.clone())
    }

    /// Describes this agent to agents that may hand off to it.
    pub fn with_handoff_description(mut self, description: impl Into<String>) -> Self {
        self.handoff_description = Some(description.into());
        self
    }

    /// Permits a handoff from this agent to the named target.
    pub fn allow_handoff_to(mut self, target: impl Into<String>) -> Self {
        self.allowed_targets.insert(target.into());
        self
    }

    /// Grants this agent a registered tool capability by name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_set.insert(tool.into());
        self
    }

    /// Declares which phase this agent serves (consumed by rule routing).
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the instruction function against a snapshot.
    pub fn instructions(&self, snapshot: &ContextSnapshot) -> String {
        (self.instructions)(snapshot, &self.name)
    }

    pub fn handoff_description(&self) -> Option<&str> {
        self.handoff_description.as_deref()
    }

    pub fn allowed_targets(&self) -> &BTreeSet<String> {
        &self.allowed_targets
    }

    pub fn tool_set(&self) -> &BTreeSet<String> {
        &self.tool_set
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    pub fn may_hand_off_to(&self, target: &str) -> bool {
        self.allowed_targets.contains(target)
    }
}

impl std::fmt::Debug for AgentDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDef")
            .field("name", &self.name)
            .field("allowed_targets", &self.allowed_targets)
            .field("tool_set", &self.tool_set)
            .field("phase", &self.phase)
            .finish()
    }
}
