//! # Ensemble
//!
//! A runtime for coordinating several specialized agents that jointly
//! service one sequential conversation. Control and shared state survive
//! transfer ("handoff") between agents: the execution loop drives each
//! turn, the router decides who speaks next, the filter chain shapes what
//! crosses a handoff boundary, and the session's shared context is the
//! single place state lives.
//!
//! ## Core concepts
//!
//! - **[`AgentDef`]**: a named agent with an instruction function, allowed
//!   handoff targets, tool capabilities, and phase membership.
//! - **[`SharedContext`]**: per-session history, metadata, and phase
//!   counters; mutated only by the loop's atomic per-turn commit.
//! - **Routing**: [`router::ModelRouter`] lets agents embed their own
//!   handoff decisions; [`router::PhaseRouter`] sequences agents from the
//!   derived phase alone.
//! - **Handoffs**: payloads cross the boundary through an ordered chain of
//!   pure filters, validated after every step.
//! - **Sessions**: [`Ensemble`] assembles the runtime; sessions are
//!   isolated, serializable, cancellable units of conversation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ensemble::{AgentDef, Ensemble, PhaseSchedule};
//! use ensemble::provider::OpenAIProvider;
//! use ensemble::router::PhaseRouter;
//! use std::sync::Arc;
//!
//! # async fn example() -> ensemble::Result<()> {
//! let schedule = PhaseSchedule::new().phase("spanish", 2).phase("english", 2);
//! let router = PhaseRouter::new(
//!     schedule.clone(),
//!     vec![
//!         ("spanish".to_string(), "Asistente Español".to_string()),
//!         ("english".to_string(), "English Assistant".to_string()),
//!     ],
//! )?;
//!
//! let ensemble = Ensemble::builder()
//!     .agent(AgentDef::new("Asistente Español", |snapshot, _| {
//!         format!(
//!             "Responde SIEMPRE en español.\n\nHistoria:\n{}",
//!             snapshot.transcript_text()
//!         )
//!     })
//!     .with_phase("spanish"))
//!     .agent(AgentDef::new("English Assistant", |snapshot, _| {
//!         format!(
//!             "ALWAYS respond in English.\n\nHistory:\n{}",
//!             snapshot.transcript_text()
//!         )
//!     })
//!     .with_phase("english"))
//!     .schedule(schedule)
//!     .router(Arc::new(router))
//!     .provider(Arc::new(OpenAIProvider::new("gpt-4")))
//!     .build()?;
//!
//! let session = ensemble.create_session();
//! let submission = ensemble.submit(&session, "¡Hola!").await?;
//! println!("{:?}", submission.outcome);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod context;
pub mod error;
pub mod graph;
pub mod handoff;
pub mod invoker;
pub mod items;
pub mod phase;
pub mod provider;
pub mod registry;
pub mod result;
pub mod router;
pub mod runner;
pub mod session;
pub mod store;
pub mod tool;

pub use agent::{AgentDef, InstructionFn};
pub use context::{ContextSnapshot, MetadataHook, SharedContext, TurnDelta};
pub use error::{EnsembleError, Result};
pub use handoff::{FilterChain, HandoffPayload};
pub use items::{Message, ModelResponse, Role, ToolCall, TurnEvent};
pub use phase::{Phase, PhaseSchedule};
pub use provider::ModelProvider;
pub use registry::AgentRegistry;
pub use result::{AbortReason, RunResult, TurnOutcome};
pub use router::Router;
pub use runner::{ExecutionLoop, LoopConfig};
pub use session::{Ensemble, SessionHandle, Submission, SubmitOutcome};
pub use store::SqliteStore;
pub use tool::{FunctionTool, Tool, ToolResult};
