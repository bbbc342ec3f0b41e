//! # Session API
//!
//! An [`Ensemble`] is the assembled runtime: registered agents and tools,
//! one routing strategy, the handoff filter chain, a phase schedule, and a
//! model provider. Sessions are its unit of isolation: each owns exactly
//! one [`SharedContext`] and one active-agent pointer, and two sessions
//! never observe each other's state.
//!
//! Within a session, [`submit`] serializes turns: the routing decision for
//! an input depends on the context committed by the previous turn, so turns
//! cannot overlap. Across sessions, submissions run freely in parallel.
//!
//! [`submit`]: Ensemble::submit
//!
//! ```rust,no_run
//! use ensemble::{AgentDef, Ensemble, PhaseSchedule};
//! use ensemble::provider::ScriptedProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> ensemble::Result<()> {
//! let ensemble = Ensemble::builder()
//!     .agent(AgentDef::with_static_instructions("Guide", "Be helpful."))
//!     .entry_agent("Guide")
//!     .provider(Arc::new(ScriptedProvider::new("scripted").with_message("Hello!")))
//!     .build()?;
//!
//! let session = ensemble.create_session();
//! let submission = ensemble.submit(&session, "Hi").await?;
//! println!("{:?}", submission.outcome);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;

use crate::agent::AgentDef;
use crate::context::{ContextSnapshot, MetadataHook, SharedContext};
use crate::error::{EnsembleError, Result};
use crate::graph::HandoffGraph;
use crate::handoff::{FilterChain, HandoffPayload};
use crate::items::TurnEvent;
use crate::phase::PhaseSchedule;
use crate::provider::{ModelProvider, Usage};
use crate::registry::AgentRegistry;
use crate::result::{AbortReason, TurnOutcome};
use crate::router::{ModelRouter, Router};
use crate::runner::{ExecutionLoop, LoopConfig};
use crate::tool::Tool;

/// Opaque handle to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: Uuid,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Terminal outcome of a submission, as seen by the caller.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The conversation turn completed and was committed.
    Final(String),
    /// The submission stopped without a committed turn.
    Aborted(AbortReason),
    /// The submission failed; the context is at its last committed boundary.
    Error(EnsembleError),
}

impl SubmitOutcome {
    pub fn final_text(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Final(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, SubmitOutcome::Final(_))
    }
}

/// Result of one submission: the outcome plus the updated context snapshot.
#[derive(Debug)]
pub struct Submission {
    pub outcome: SubmitOutcome,
    /// The agent holding control when the submission ended.
    pub final_agent: String,
    /// Diagnostic trace of the submission.
    pub events: Vec<TurnEvent>,
    pub usage: Usage,
    /// Snapshot of the session context after the submission.
    pub snapshot: ContextSnapshot,
}

/// The state guarded by a session's turn lock: the context plus the
/// active-agent pointer a handoff durably moves.
struct SessionState {
    context: SharedContext,
    active_agent: Option<String>,
}

struct SessionEntry {
    state: tokio::sync::Mutex<SessionState>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    cancelled: AtomicBool,
}

impl SessionEntry {
    fn new(context: SharedContext) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            state: tokio::sync::Mutex::new(SessionState {
                context,
                active_agent: None,
            }),
            cancel_tx,
            cancel_rx,
            cancelled: AtomicBool::new(false),
        }
    }
}

/// The assembled orchestration runtime.
pub struct Ensemble {
    registry: Arc<AgentRegistry>,
    router: Arc<dyn Router>,
    schedule: Arc<PhaseSchedule>,
    entry_agent: Option<String>,
    exec: ExecutionLoop,
    sessions: Mutex<HashMap<Uuid, Arc<SessionEntry>>>,
}

impl std::fmt::Debug for Ensemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ensemble").finish_non_exhaustive()
    }
}

impl Ensemble {
    pub fn builder() -> EnsembleBuilder {
        EnsembleBuilder::default()
    }

    /// Creates an empty session.
    pub fn create_session(&self) -> SessionHandle {
        self.install_session(SharedContext::new())
    }

    /// Creates a session from a previously persisted context, resuming the
    /// conversation at the same phase and history.
    pub fn restore_session(&self, context: SharedContext) -> SessionHandle {
        self.install_session(context)
    }

    fn install_session(&self, context: SharedContext) -> SessionHandle {
        let handle = SessionHandle { id: Uuid::new_v4() };
        self.sessions
            .lock()
            .unwrap()
            .insert(handle.id, Arc::new(SessionEntry::new(context)));
        handle
    }

    fn entry_for(&self, handle: &SessionHandle) -> Result<Arc<SessionEntry>> {
        self.sessions
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| EnsembleError::Session(format!("unknown session {}", handle.id)))
    }

    /// Submits one input to the session and runs it to a terminal result.
    ///
    /// Turns within a session are serialized; a second concurrent `submit`
    /// waits for the first to commit or abort.
    pub async fn submit(
        &self,
        handle: &SessionHandle,
        input: impl Into<String>,
    ) -> Result<Submission> {
        let input = input.into();
        let entry = self.entry_for(handle)?;
        let mut state = entry.state.lock().await;

        if entry.cancelled.load(Ordering::SeqCst) {
            return Ok(Submission {
                outcome: SubmitOutcome::Aborted(AbortReason::Cancelled),
                final_agent: state.active_agent.clone().unwrap_or_default(),
                events: Vec::new(),
                usage: Usage::empty(),
                snapshot: state.context.snapshot(),
            });
        }

        if state.context.phase(&self.schedule).is_terminal() {
            return Ok(Submission {
                outcome: SubmitOutcome::Aborted(AbortReason::PhaseComplete),
                final_agent: state.active_agent.clone().unwrap_or_default(),
                events: Vec::new(),
                usage: Usage::empty(),
                snapshot: state.context.snapshot(),
            });
        }

        // Who opens this submission: a rule router names an agent outright;
        // otherwise control stays where the last handoff left it, falling
        // back to the configured entry agent for a fresh session.
        let snapshot = state.context.snapshot();
        let entry_name = self
            .router
            .entry(&snapshot)
            .or_else(|| state.active_agent.clone())
            .or_else(|| self.entry_agent.clone())
            .ok_or_else(|| EnsembleError::config("no entry agent configured"))?;
        let agent = self.registry.agent(&entry_name).ok_or_else(|| {
            EnsembleError::routing(format!("entry agent '{}' is not registered", entry_name))
        })?;

        let mut cancel_rx = entry.cancel_rx.clone();
        let result = self
            .exec
            .run(agent, &input, &mut state.context, &mut cancel_rx)
            .await;
        let snapshot = state.context.snapshot();

        Ok(match result {
            Ok(run) => {
                state.active_agent = Some(run.final_agent.clone());
                Submission {
                    outcome: match run.outcome {
                        TurnOutcome::Final(text) => SubmitOutcome::Final(text),
                        TurnOutcome::Aborted(reason) => SubmitOutcome::Aborted(reason),
                    },
                    final_agent: run.final_agent,
                    events: run.events,
                    usage: run.usage,
                    snapshot,
                }
            }
            // A failed transition leaves control on the source agent.
            Err(error) => Submission {
                outcome: SubmitOutcome::Error(error),
                final_agent: entry_name,
                events: Vec::new(),
                usage: Usage::empty(),
                snapshot,
            },
        })
    }

    /// Snapshot of a session's current context.
    pub async fn snapshot(&self, handle: &SessionHandle) -> Result<ContextSnapshot> {
        let entry = self.entry_for(handle)?;
        let state = entry.state.lock().await;
        Ok(state.context.snapshot())
    }

    /// The agent currently holding control of the session, if any turn has
    /// completed yet.
    pub async fn active_agent(&self, handle: &SessionHandle) -> Result<Option<String>> {
        let entry = self.entry_for(handle)?;
        let state = entry.state.lock().await;
        Ok(state.active_agent.clone())
    }

    /// Cancels a session: any in-flight submission aborts at the last
    /// committed boundary, and later submissions abort immediately. The
    /// context stays inspectable.
    pub fn cancel(&self, handle: &SessionHandle) -> Result<()> {
        let entry = self.entry_for(handle)?;
        entry.cancelled.store(true, Ordering::SeqCst);
        let _ = entry.cancel_tx.send(true);
        Ok(())
    }

    /// Removes the session and returns its final context for archival.
    pub async fn end_session(&self, handle: &SessionHandle) -> Result<SharedContext> {
        let entry = self
            .sessions
            .lock()
            .unwrap()
            .remove(&handle.id)
            .ok_or_else(|| EnsembleError::Session(format!("unknown session {}", handle.id)))?;
        let state = entry.state.lock().await;
        Ok(state.context.clone())
    }

    /// The declared handoff graph, for introspection.
    pub fn handoff_graph(&self) -> HandoffGraph {
        HandoffGraph::from_registry(&self.registry)
    }

    pub fn schedule(&self) -> &PhaseSchedule {
        &self.schedule
    }
}

/// Builder assembling an [`Ensemble`]; validation happens in [`build`].
///
/// [`build`]: Self::build
#[derive(Default)]
pub struct EnsembleBuilder {
    agents: Vec<AgentDef>,
    tools: Vec<Arc<dyn Tool>>,
    router: Option<Arc<dyn Router>>,
    schedule: Option<PhaseSchedule>,
    filters: FilterChain,
    hooks: Vec<MetadataHook>,
    provider: Option<Arc<dyn ModelProvider>>,
    entry_agent: Option<String>,
    config: LoopConfig,
}

impl EnsembleBuilder {
    pub fn agent(mut self, agent: AgentDef) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Routing strategy; defaults to [`ModelRouter`] over the registered
    /// agents.
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Phase schedule; defaults to a single effectively unbounded phase.
    pub fn schedule(mut self, schedule: PhaseSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Appends a handoff filter; filters run in registration order.
    pub fn handoff_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(HandoffPayload) -> HandoffPayload + Send + Sync + 'static,
    {
        self.filters.push(filter);
        self
    }

    /// Appends a metadata hook, run after each turn's final answer over the
    /// finished exchange; the entries it returns commit with that turn.
    pub fn metadata_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ContextSnapshot) -> Vec<(String, serde_json::Value)> + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Agent that opens a submission when the router does not name one.
    pub fn entry_agent(mut self, name: impl Into<String>) -> Self {
        self.entry_agent = Some(name.into());
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Ensemble> {
        let mut registry = AgentRegistry::new();
        for tool in self.tools {
            registry.register_tool(tool)?;
        }
        for agent in self.agents {
            registry.register_agent(agent)?;
        }
        registry.validate()?;

        let graph = HandoffGraph::from_registry(&registry);
        graph.validate()?;

        let schedule = self
            .schedule
            .unwrap_or_else(|| PhaseSchedule::new().phase("conversation", u64::MAX));
        schedule.validate()?;

        for agent in registry.agents() {
            if let Some(phase) = agent.phase() {
                if !schedule.contains(phase) {
                    return Err(EnsembleError::config(format!(
                        "agent '{}' declares unknown phase '{}'",
                        agent.name(),
                        phase
                    )));
                }
            }
        }

        if let Some(entry) = &self.entry_agent {
            if registry.agent(entry).is_none() {
                return Err(EnsembleError::config(format!(
                    "entry agent '{}' is not registered",
                    entry
                )));
            }
        }

        let provider = self
            .provider
            .ok_or_else(|| EnsembleError::config("a model provider is required"))?;

        let registry = Arc::new(registry);
        let router: Arc<dyn Router> = match self.router {
            Some(router) => router,
            None => Arc::new(ModelRouter::new(
                registry.agent_names().into_iter().collect(),
            )),
        };
        let schedule = Arc::new(schedule);

        let exec = ExecutionLoop::new(
            registry.clone(),
            router.clone(),
            Arc::new(self.filters),
            Arc::new(self.hooks),
            provider,
            schedule.clone(),
            self.config,
        );

        Ok(Ensemble {
            registry,
            router,
            schedule,
            entry_agent: self.entry_agent,
            exec,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    fn simple_ensemble(provider: ScriptedProvider) -> Ensemble {
        Ensemble::builder()
            .agent(AgentDef::with_static_instructions("Guide", "Be helpful."))
            .entry_agent("Guide")
            .provider(Arc::new(provider))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_submit() {
        let ensemble = simple_ensemble(ScriptedProvider::new("scripted").with_message("Hi!"));
        let session = ensemble.create_session();

        let submission = ensemble.submit(&session, "Hello").await.unwrap();
        assert_eq!(submission.outcome.final_text(), Some("Hi!"));
        assert_eq!(submission.snapshot.history.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_is_error() {
        let ensemble = simple_ensemble(ScriptedProvider::new("scripted"));
        let bogus = SessionHandle { id: Uuid::new_v4() };
        let err = ensemble.submit(&bogus, "Hello").await.unwrap_err();
        assert!(matches!(err, EnsembleError::Session(_)));
    }

    #[tokio::test]
    async fn test_cancelled_session_stays_inspectable() {
        let ensemble = simple_ensemble(
            ScriptedProvider::new("scripted")
                .with_message("first")
                .with_message("unreachable"),
        );
        let session = ensemble.create_session();
        ensemble.submit(&session, "one").await.unwrap();

        ensemble.cancel(&session).unwrap();
        let submission = ensemble.submit(&session, "two").await.unwrap();
        assert!(matches!(
            submission.outcome,
            SubmitOutcome::Aborted(AbortReason::Cancelled)
        ));

        // The committed first turn is still visible.
        let snapshot = ensemble.snapshot(&session).await.unwrap();
        assert_eq!(snapshot.history.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_session_resumes_phase_and_history() {
        let ensemble = Ensemble::builder()
            .agent(AgentDef::with_static_instructions("Guide", "Be helpful."))
            .entry_agent("Guide")
            .schedule(PhaseSchedule::new().phase("only", 1))
            .provider(Arc::new(ScriptedProvider::new("scripted").with_message("x")))
            .build()
            .unwrap();

        let session = ensemble.create_session();
        let first = ensemble.submit(&session, "hello").await.unwrap();
        assert!(first.outcome.is_final());
        let archived = ensemble.end_session(&session).await.unwrap();

        let restored = ensemble.restore_session(archived);
        let submission = ensemble.submit(&restored, "again").await.unwrap();
        // The restored context is already past its single phase.
        assert!(matches!(
            submission.outcome,
            SubmitOutcome::Aborted(AbortReason::PhaseComplete)
        ));
        let snapshot = ensemble.snapshot(&restored).await.unwrap();
        assert_eq!(snapshot.history.len(), 2);
    }

    #[tokio::test]
    async fn test_handoff_moves_control_durably() {
        // First submission hands off to the specialist; the second goes
        // straight to the specialist without another handoff.
        let ensemble = Ensemble::builder()
            .agent(
                AgentDef::with_static_instructions("Triage", "Route requests.")
                    .allow_handoff_to("Specialist"),
            )
            .agent(
                AgentDef::with_static_instructions("Specialist", "Handle details.")
                    .with_handoff_description("Handles hard questions"),
            )
            .entry_agent("Triage")
            .provider(Arc::new(
                ScriptedProvider::new("scripted")
                    .with_handoff("Specialist", "needs detail")
                    .with_message("detailed answer")
                    .with_message("follow-up answer"),
            ))
            .build()
            .unwrap();

        let session = ensemble.create_session();
        let first = ensemble.submit(&session, "help").await.unwrap();
        assert_eq!(first.final_agent, "Specialist");

        let second = ensemble.submit(&session, "and then?").await.unwrap();
        assert_eq!(second.outcome.final_text(), Some("follow-up answer"));
        assert_eq!(second.final_agent, "Specialist");
        assert_eq!(
            ensemble.active_agent(&session).await.unwrap(),
            Some("Specialist".to_string())
        );
    }

    #[tokio::test]
    async fn test_build_rejects_bad_configuration() {
        // Missing provider.
        let err = Ensemble::builder()
            .agent(AgentDef::with_static_instructions("A", "x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Config { .. }));

        // Dangling handoff target.
        let err = Ensemble::builder()
            .agent(AgentDef::with_static_instructions("A", "x").allow_handoff_to("Ghost"))
            .provider(Arc::new(ScriptedProvider::new("scripted")))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Config { .. }));

        // Unknown phase membership.
        let err = Ensemble::builder()
            .agent(AgentDef::with_static_instructions("A", "x").with_phase("ghost-phase"))
            .schedule(PhaseSchedule::new().phase("real", 1))
            .provider(Arc::new(ScriptedProvider::new("scripted")))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Config { .. }));
    }

    #[tokio::test]
    async fn test_submit_without_entry_agent_is_config_error() {
        let ensemble = Ensemble::builder()
            .agent(AgentDef::with_static_instructions("A", "x"))
            .provider(Arc::new(ScriptedProvider::new("scripted")))
            .build()
            .unwrap();
        let session = ensemble.create_session();
        let err = ensemble.submit(&session, "hi").await.unwrap_err();
        assert!(matches!(err, EnsembleError::Config { .. }));
    }
}
