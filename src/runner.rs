//! # Execution loop
//!
//! The [`ExecutionLoop`] drives one submission through the runtime: it asks
//! the active agent (via the model provider) for output, then branches on
//! what came back: a final answer, tool-call requests, or a handoff
//! request. Tool calls fan out through the [`ToolInvoker`] and loop; handoff
//! requests resolve through the router and filter chain before the active
//! agent switches; a final answer commits exactly one [`TurnDelta`] to the
//! shared context and ends the submission.
//!
//! Safety bounds: `max_turns` caps provider invocations per submission and
//! aborts exactly when the counter would exceed it; the per-turn timeout and
//! session cancellation both interrupt in-flight provider and tool futures
//! and leave the context at its last committed boundary. The absorbing
//! terminal phase is detected before any turn is issued.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::agent::AgentDef;
use crate::context::{MetadataHook, SharedContext, TurnDelta};
use crate::error::{EnsembleError, Result};
use crate::handoff::{FilterChain, HandoffPayload};
use crate::invoker::{RetryPolicy, ToolInvoker};
use crate::items::{
    HandoffEvent, Message, MessageEvent, ModelResponse, Role, ToolCallEvent, ToolOutputEvent,
    TurnEvent,
};
use crate::phase::PhaseSchedule;
use crate::provider::{ModelProvider, Usage};
use crate::registry::AgentRegistry;
use crate::result::{AbortReason, RunResult, TurnOutcome};
use crate::router::Router;

/// Configuration for the execution loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum provider invocations per submission.
    pub max_turns: usize,
    /// Wall-clock budget for each turn (provider call plus tool barrier).
    pub turn_timeout: Option<Duration>,
    /// Retry policy for upstream inference failures.
    pub provider_retry: RetryPolicy,
    /// Retry policy for tool execution failures.
    pub tool_retry: RetryPolicy,
    /// Per-call timeout inside the tool stack.
    pub tool_call_timeout: Option<Duration>,
    /// Cap on concurrent tool calls within one turn.
    pub max_tool_concurrency: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            turn_timeout: None,
            provider_retry: RetryPolicy::default(),
            tool_retry: RetryPolicy::default(),
            tool_call_timeout: None,
            max_tool_concurrency: None,
        }
    }
}

/// Pseudo-tool advertising a handoff target to the provider.
///
/// The loop intercepts calls to it before execution; `execute` only runs if
/// something bypasses the interception, and then it is a no-op ack.
#[derive(Debug, Clone)]
struct HandoffTool {
    name: String,
    description: String,
}

#[async_trait::async_trait]
impl crate::tool::Tool for HandoffTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "Reason for handoff"}
            }
        })
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<crate::tool::ToolResult> {
        Ok(crate::tool::ToolResult::success(
            serde_json::json!({"handoff": true}),
        ))
    }
}

enum Step<T> {
    Ready(T),
    Abort(AbortReason),
}

/// Drives submissions turn by turn. Stateless between submissions; all
/// session state lives in the [`SharedContext`] passed to [`run`].
///
/// [`run`]: Self::run
pub struct ExecutionLoop {
    registry: Arc<AgentRegistry>,
    router: Arc<dyn Router>,
    filters: Arc<FilterChain>,
    hooks: Arc<Vec<MetadataHook>>,
    provider: Arc<dyn ModelProvider>,
    schedule: Arc<PhaseSchedule>,
    invoker: ToolInvoker,
    config: LoopConfig,
}

impl ExecutionLoop {
    pub fn new(
        registry: Arc<AgentRegistry>,
        router: Arc<dyn Router>,
        filters: Arc<FilterChain>,
        hooks: Arc<Vec<MetadataHook>>,
        provider: Arc<dyn ModelProvider>,
        schedule: Arc<PhaseSchedule>,
        config: LoopConfig,
    ) -> Self {
        let mut invoker = ToolInvoker::new(config.tool_retry);
        if let Some(timeout) = config.tool_call_timeout {
            invoker = invoker.with_call_timeout(timeout);
        }
        if let Some(limit) = config.max_tool_concurrency {
            invoker = invoker.with_max_concurrency(limit);
        }
        Self {
            registry,
            router,
            filters,
            hooks,
            provider,
            schedule,
            invoker,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Runs one submission against the shared context.
    ///
    /// On a final answer the context receives exactly one commit; on any
    /// abort or error it is left untouched at the previous turn boundary.
    pub async fn run(
        &self,
        initial: Arc<AgentDef>,
        input: &str,
        ctx: &mut SharedContext,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RunResult> {
        let started_phase = self.schedule.phase_of(ctx.counters());
        if started_phase.is_terminal() {
            debug!(agent = %initial.name(), "terminal phase reached; no turn issued");
            return Ok(Self::aborted(
                AbortReason::PhaseComplete,
                initial.name(),
                Vec::new(),
                Usage::empty(),
            ));
        }

        let mut active = initial;
        let mut events: Vec<TurnEvent> = Vec::new();
        let mut usage = Usage::empty();

        // The submission's working view, in three segments: committed
        // history, turn machinery, and the pending input. Their
        // concatenation is exactly what a handoff payload carries.
        let mut prior: Vec<Message> = ctx.history().to_vec();
        let mut turn_items: Vec<Message> = Vec::new();
        let mut pending: Vec<Message> = vec![Message::user(input)];

        events.push(TurnEvent::Message(MessageEvent::new(Role::User, input)));
        info!(agent = %active.name(), "starting submission");

        let mut turn = 0usize;
        loop {
            turn += 1;
            if turn > self.config.max_turns {
                return Ok(Self::aborted(
                    AbortReason::TurnLimitExceeded {
                        max_turns: self.config.max_turns,
                    },
                    active.name(),
                    events,
                    usage,
                ));
            }
            if *cancel.borrow() {
                return Ok(Self::aborted(
                    AbortReason::Cancelled,
                    active.name(),
                    events,
                    usage,
                ));
            }

            debug!(turn, agent = %active.name(), "starting turn");
            let deadline = self.config.turn_timeout.map(|d| Instant::now() + d);

            let mut transcript = prior.clone();
            transcript.extend(turn_items.iter().cloned());
            transcript.extend(pending.iter().cloned());
            let snapshot = ctx.snapshot_with_transcript(transcript.clone());

            let mut messages = vec![self.registry.system_message(&active, &snapshot)];
            messages.extend(transcript);

            let mut advertised = self.registry.tools_for(&active);
            for (name, description) in self.registry.handoffs_for(&active) {
                advertised.push(Arc::new(HandoffTool { name, description }));
            }

            let (response, call_usage) = match self
                .complete_with_retry(messages, advertised, deadline, cancel)
                .await?
            {
                Step::Ready(out) => out,
                Step::Abort(reason) => {
                    return Ok(Self::aborted(reason, active.name(), events, usage))
                }
            };
            usage.add(&call_usage);

            // Routing decision: fatal on error, before anything mutates.
            let target = self.router.select_next(&snapshot, &active, &response)?;
            if let Some(name) = target {
                if name != active.name() {
                    let next = self.registry.agent(&name).ok_or_else(|| {
                        EnsembleError::routing(format!(
                            "selected agent '{}' is not registered",
                            name
                        ))
                    })?;

                    let mut reason = None;
                    if let Some(call) =
                        response.tool_calls.iter().find(|c| c.name == name)
                    {
                        reason = call
                            .arguments
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                        events.push(TurnEvent::ToolCall(ToolCallEvent {
                            id: call.id.clone(),
                            tool_name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            created_at: chrono::Utc::now(),
                        }));
                        let ack = serde_json::json!({"handoff": name, "ack": true});
                        turn_items.push(Message::assistant_with_tool_calls(
                            response.content.clone().unwrap_or_default(),
                            vec![call.clone()],
                        ));
                        turn_items.push(Message::tool(ack.to_string(), &call.id));
                        events.push(TurnEvent::ToolOutput(ToolOutputEvent {
                            id: uuid::Uuid::new_v4().to_string(),
                            tool_call_id: call.id.clone(),
                            output: ack,
                            error: None,
                            created_at: chrono::Utc::now(),
                        }));
                    }

                    let payload = HandoffPayload {
                        prior_history: std::mem::take(&mut prior),
                        pre_handoff_items: std::mem::take(&mut turn_items),
                        new_items: std::mem::take(&mut pending),
                    };
                    // A filter failure aborts the transition: nothing was
                    // committed and the session stays on the source agent.
                    let filtered = self.filters.apply(payload)?;
                    prior = filtered.prior_history;
                    turn_items = filtered.pre_handoff_items;
                    pending = filtered.new_items;

                    info!(from = %active.name(), to = %name, "handoff");
                    events.push(TurnEvent::Handoff(HandoffEvent {
                        id: uuid::Uuid::new_v4().to_string(),
                        from_agent: active.name().to_string(),
                        to_agent: name.clone(),
                        reason,
                        created_at: chrono::Utc::now(),
                    }));

                    active = next;
                    continue;
                }
            }

            if response.has_tool_calls() {
                let calls = response.tool_calls.clone();
                turn_items.push(Message::assistant_with_tool_calls(
                    response.content.clone().unwrap_or_default(),
                    calls.clone(),
                ));
                for call in &calls {
                    events.push(TurnEvent::ToolCall(ToolCallEvent {
                        id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        created_at: chrono::Utc::now(),
                    }));
                }

                let tools = self.registry.tools_for(&active);
                let outcomes = match Self::bounded(
                    self.invoker.invoke_all(active.name(), &calls, &tools),
                    deadline,
                    cancel,
                )
                .await
                {
                    Step::Ready(outcomes) => outcomes,
                    Step::Abort(reason) => {
                        return Ok(Self::aborted(reason, active.name(), events, usage))
                    }
                };

                for outcome in outcomes {
                    for attempt in &outcome.attempts {
                        events.push(TurnEvent::ToolOutput(ToolOutputEvent {
                            id: uuid::Uuid::new_v4().to_string(),
                            tool_call_id: outcome.call.id.clone(),
                            output: attempt.output.clone(),
                            error: attempt.error.clone(),
                            created_at: chrono::Utc::now(),
                        }));
                    }
                    let last = outcome.final_response();
                    let content = match &last.error {
                        Some(err) => format!("Error: {}", err),
                        None => serde_json::to_string(&last.output)
                            .unwrap_or_else(|_| "null".to_string()),
                    };
                    turn_items.push(Message::tool(content, &outcome.call.id));
                }
                continue;
            }

            if let Some(content) = response.content.as_deref().filter(|c| !c.is_empty()) {
                let mut delta = TurnDelta::new();
                for message in pending.drain(..) {
                    delta.push_message(message);
                }
                delta.push_message(Message::assistant(content));
                if let Some(phase) = started_phase.name() {
                    delta.attribute_to(phase);
                }

                // Metadata derived from the finished exchange joins the
                // same commit.
                if !self.hooks.is_empty() {
                    let mut exchange = snapshot;
                    exchange.history.push(Message::assistant(content));
                    for hook in self.hooks.iter() {
                        for (key, value) in hook(&exchange) {
                            delta.set_metadata(key, value);
                        }
                    }
                }
                ctx.apply(delta);

                events.push(TurnEvent::Message(MessageEvent::new(
                    Role::Assistant,
                    content,
                )));
                info!(agent = %active.name(), "final answer committed");
                return Ok(RunResult {
                    outcome: TurnOutcome::Final(content.to_string()),
                    final_agent: active.name().to_string(),
                    events,
                    usage,
                });
            }

            return Err(EnsembleError::provider(
                "model returned neither content nor tool calls",
            ));
        }
    }

    async fn complete_with_retry(
        &self,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn crate::tool::Tool>>,
        deadline: Option<Instant>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Step<(ModelResponse, Usage)>> {
        let attempts = self.config.provider_retry.attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let result = match Self::bounded(
                self.provider.complete(messages.clone(), tools.clone()),
                deadline,
                cancel,
            )
            .await
            {
                Step::Ready(result) => result,
                Step::Abort(reason) => return Ok(Step::Abort(reason)),
            };
            match result {
                Ok(out) => return Ok(Step::Ready(out)),
                Err(e) => {
                    warn!(attempt, error = %e, "provider call failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        sleep(self.config.provider_retry.delay_before(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EnsembleError::provider("provider failed")))
    }

    /// Awaits a future under the turn deadline and session cancellation.
    async fn bounded<T>(
        fut: impl Future<Output = T>,
        deadline: Option<Instant>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Step<T> {
        let cancelled = async {
            loop {
                if *cancel.borrow() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    // Sender gone: cancellation can no longer arrive.
                    futures::future::pending::<()>().await;
                }
            }
        };
        tokio::pin!(fut);
        tokio::pin!(cancelled);

        match deadline {
            Some(d) => {
                let timer = sleep_until(d);
                tokio::pin!(timer);
                tokio::select! {
                    res = &mut fut => Step::Ready(res),
                    _ = &mut cancelled => Step::Abort(AbortReason::Cancelled),
                    _ = &mut timer => Step::Abort(AbortReason::Timeout),
                }
            }
            None => {
                tokio::select! {
                    res = &mut fut => Step::Ready(res),
                    _ = &mut cancelled => Step::Abort(AbortReason::Cancelled),
                }
            }
        }
    }

    fn aborted(
        reason: AbortReason,
        agent: &str,
        events: Vec<TurnEvent>,
        usage: Usage,
    ) -> RunResult {
        RunResult {
            outcome: TurnOutcome::Aborted(reason),
            final_agent: agent.to_string(),
            events,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSnapshot;
    use crate::provider::ScriptedProvider;
    use crate::router::{ModelRouter, PhaseRouter};
    use crate::tool::FunctionTool;
    use std::collections::BTreeSet;

    fn watch_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn registry_with(agents: Vec<AgentDef>) -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry
            .register_tool(Arc::new(FunctionTool::simple(
                "uppercase",
                "Converts to uppercase",
                |s: String| s.to_uppercase(),
            )))
            .unwrap();
        for agent in agents {
            registry.register_agent(agent).unwrap();
        }
        Arc::new(registry)
    }

    fn model_router(registry: &AgentRegistry) -> Arc<dyn Router> {
        let known: BTreeSet<String> = registry.agent_names().into_iter().collect();
        Arc::new(ModelRouter::new(known))
    }

    fn single_phase_schedule() -> Arc<PhaseSchedule> {
        Arc::new(PhaseSchedule::new().phase("chat", 100))
    }

    fn exec_loop(
        registry: Arc<AgentRegistry>,
        provider: Arc<dyn ModelProvider>,
        config: LoopConfig,
    ) -> ExecutionLoop {
        let router = model_router(&registry);
        ExecutionLoop::new(
            registry,
            router,
            Arc::new(FilterChain::new()),
            Arc::new(Vec::new()),
            provider,
            single_phase_schedule(),
            config,
        )
    }

    #[tokio::test]
    async fn test_simple_final_answer_commits_one_turn() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )]);
        let provider = Arc::new(ScriptedProvider::new("scripted").with_message("Hello there"));
        let exec = exec_loop(registry.clone(), provider, LoopConfig::default());

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Echo").unwrap(), "Hi", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert!(result.is_final());
        assert_eq!(result.final_text(), Some("Hello there"));
        assert_eq!(ctx.history().len(), 2);
        assert_eq!(ctx.history()[0].role, Role::User);
        assert_eq!(ctx.history()[1].role, Role::Assistant);
        assert_eq!(ctx.counters().get("chat"), Some(&1));
    }

    #[tokio::test]
    async fn test_metadata_hook_entries_join_the_commit() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )]);
        let provider = Arc::new(ScriptedProvider::new("scripted").with_message("ok"));
        let hooks: Vec<MetadataHook> = vec![Arc::new(|exchange: &ContextSnapshot| {
            // The hook sees the exchange ending in the final answer.
            let last = exchange.history.last().expect("nonempty exchange");
            vec![("last_reply".to_string(), serde_json::json!(last.content))]
        })];
        let exec = ExecutionLoop::new(
            registry.clone(),
            model_router(&registry),
            Arc::new(FilterChain::new()),
            Arc::new(hooks),
            provider,
            single_phase_schedule(),
            LoopConfig::default(),
        );

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Echo").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert!(result.is_final());
        assert_eq!(
            ctx.metadata().get("last_reply"),
            Some(&serde_json::json!("ok"))
        );
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Tools",
            "Use tools.",
        )
        .with_tool("uppercase")]);
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_tool_call("uppercase", serde_json::json!({"input": "hola"}))
                .with_message("The result is HOLA"),
        );
        let exec = exec_loop(registry.clone(), provider, LoopConfig::default());

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(
                registry.agent("Tools").unwrap(),
                "uppercase hola",
                &mut ctx,
                &mut rx,
            )
            .await
            .unwrap();

        assert!(result.is_final());
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, TurnEvent::ToolCall(_))));
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, TurnEvent::ToolOutput(o) if o.error.is_none())));
        // Tool traffic is diagnostic only; history holds the exchange.
        assert_eq!(ctx.history().len(), 2);
    }

    #[tokio::test]
    async fn test_turn_limit_aborts_exactly_at_bound() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Loopy",
            "Use tools forever.",
        )
        .with_tool("uppercase")]);
        // Two tool-call turns, then an answer on the third invocation.
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_tool_call("uppercase", serde_json::json!({"input": "a"}))
                .with_tool_call("uppercase", serde_json::json!({"input": "b"}))
                .with_message("done"),
        );

        // max_turns = 3 admits exactly those three invocations.
        let config = LoopConfig {
            max_turns: 3,
            ..Default::default()
        };
        let exec = exec_loop(registry.clone(), provider, config);
        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Loopy").unwrap(), "go", &mut ctx, &mut rx)
            .await
            .unwrap();
        assert!(result.is_final());

        // max_turns = 2 aborts on what would be the third invocation.
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_tool_call("uppercase", serde_json::json!({"input": "a"}))
                .with_tool_call("uppercase", serde_json::json!({"input": "b"}))
                .with_message("done"),
        );
        let config = LoopConfig {
            max_turns: 2,
            ..Default::default()
        };
        let exec = exec_loop(registry.clone(), provider, config);
        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Loopy").unwrap(), "go", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert_eq!(
            result.abort_reason(),
            Some(&AbortReason::TurnLimitExceeded { max_turns: 2 })
        );
        // Aborted submission commits nothing.
        assert!(ctx.history().is_empty());
        assert!(ctx.counters().is_empty());
    }

    #[tokio::test]
    async fn test_handoff_switches_active_agent() {
        let spanish = AgentDef::with_static_instructions("Spanish", "Responde en español.")
            .with_handoff_description("Responds in Spanish");
        let triage = AgentDef::with_static_instructions("Triage", "Route requests.")
            .allow_handoff_to("Spanish");
        let registry = registry_with(vec![spanish, triage]);

        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_handoff("Spanish", "user speaks Spanish")
                .with_message("¡Hola!"),
        );
        let exec = exec_loop(registry.clone(), provider, LoopConfig::default());

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Triage").unwrap(), "hola", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert!(result.is_final());
        assert_eq!(result.final_agent, "Spanish");
        assert!(result.events.iter().any(
            |e| matches!(e, TurnEvent::Handoff(h) if h.from_agent == "Triage" && h.to_agent == "Spanish")
        ));
    }

    #[tokio::test]
    async fn test_disallowed_handoff_is_routing_error() {
        let english = AgentDef::with_static_instructions("English", "Respond in English.");
        let triage = AgentDef::with_static_instructions("Triage", "Route requests.");
        let registry = registry_with(vec![english, triage]);

        let provider = Arc::new(
            ScriptedProvider::new("scripted").with_handoff("English", "routing attempt"),
        );
        let exec = exec_loop(registry.clone(), provider, LoopConfig::default());

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let err = exec
            .run(registry.agent("Triage").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap_err();

        assert!(matches!(err, EnsembleError::Routing { .. }));
        // The failed transition committed nothing.
        assert!(ctx.history().is_empty());
    }

    #[tokio::test]
    async fn test_filter_error_aborts_handoff_without_commit() {
        let spanish = AgentDef::with_static_instructions("Spanish", "Responde en español.");
        let triage = AgentDef::with_static_instructions("Triage", "Route requests.")
            .allow_handoff_to("Spanish");
        let registry = registry_with(vec![spanish, triage]);

        let mut filters = FilterChain::new();
        filters.push(|mut payload: HandoffPayload| {
            // Breaks validity: a tool message with no call id.
            payload.pre_handoff_items.push(Message {
                role: Role::Tool,
                content: "broken".to_string(),
                tool_call_id: None,
                tool_calls: None,
            });
            payload
        });

        let provider = Arc::new(
            ScriptedProvider::new("scripted").with_handoff("Spanish", "language"),
        );
        let router = model_router(&registry);
        let exec = ExecutionLoop::new(
            registry.clone(),
            router,
            Arc::new(filters),
            Arc::new(Vec::new()),
            provider,
            single_phase_schedule(),
            LoopConfig::default(),
        );

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let err = exec
            .run(registry.agent("Triage").unwrap(), "hola", &mut ctx, &mut rx)
            .await
            .unwrap_err();

        assert!(matches!(err, EnsembleError::Filter { .. }));
        assert!(ctx.history().is_empty());
        assert!(ctx.counters().is_empty());
    }

    #[tokio::test]
    async fn test_provider_retry_recovers() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )]);
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_failure("rate limited")
                .with_message("Recovered answer"),
        );
        let config = LoopConfig {
            provider_retry: RetryPolicy::times(2),
            ..Default::default()
        };
        let exec = exec_loop(registry.clone(), provider, config);

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Echo").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert_eq!(result.final_text(), Some("Recovered answer"));
    }

    #[tokio::test]
    async fn test_provider_exhaustion_is_error_and_preserves_context() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )]);
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_failure("down")
                .with_failure("still down"),
        );
        let config = LoopConfig {
            provider_retry: RetryPolicy::times(2),
            ..Default::default()
        };
        let exec = exec_loop(registry.clone(), provider, config);

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let err = exec
            .run(registry.agent("Echo").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap_err();

        assert!(matches!(err, EnsembleError::Provider { .. }));
        assert!(ctx.history().is_empty());
    }

    #[tokio::test]
    async fn test_turn_timeout_aborts_at_committed_boundary() {
        struct SlowProvider;

        #[async_trait::async_trait]
        impl ModelProvider for SlowProvider {
            async fn complete(
                &self,
                _messages: Vec<Message>,
                _tools: Vec<Arc<dyn crate::tool::Tool>>,
            ) -> Result<(ModelResponse, Usage)> {
                sleep(Duration::from_secs(30)).await;
                Ok((ModelResponse::new_message("too late"), Usage::empty()))
            }
            fn model_name(&self) -> &str {
                "slow"
            }
        }

        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )]);
        let config = LoopConfig {
            turn_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let exec = exec_loop(registry.clone(), Arc::new(SlowProvider), config);

        let mut ctx = SharedContext::new();
        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Echo").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert_eq!(result.abort_reason(), Some(&AbortReason::Timeout));
        assert!(ctx.history().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_in_flight_turn() {
        struct SlowProvider;

        #[async_trait::async_trait]
        impl ModelProvider for SlowProvider {
            async fn complete(
                &self,
                _messages: Vec<Message>,
                _tools: Vec<Arc<dyn crate::tool::Tool>>,
            ) -> Result<(ModelResponse, Usage)> {
                sleep(Duration::from_secs(30)).await;
                Ok((ModelResponse::new_message("too late"), Usage::empty()))
            }
            fn model_name(&self) -> &str {
                "slow"
            }
        }

        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )]);
        let exec = exec_loop(registry.clone(), Arc::new(SlowProvider), LoopConfig::default());

        let mut ctx = SharedContext::new();
        let (tx, mut rx) = watch_pair();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let result = exec
            .run(registry.agent("Echo").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert_eq!(result.abort_reason(), Some(&AbortReason::Cancelled));
        assert!(ctx.history().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_phase_issues_no_turns() {
        let registry = registry_with(vec![AgentDef::with_static_instructions(
            "Echo",
            "Answer briefly.",
        )
        .with_phase("only")]);
        // Script would answer, but no provider call may happen.
        let provider = Arc::new(ScriptedProvider::new("scripted").with_message("unreachable"));
        let schedule = Arc::new(PhaseSchedule::new().phase("only", 1));
        let router = Arc::new(
            PhaseRouter::new(
                PhaseSchedule::new().phase("only", 1),
                vec![("only".to_string(), "Echo".to_string())],
            )
            .unwrap(),
        );
        let exec = ExecutionLoop::new(
            registry.clone(),
            router,
            Arc::new(FilterChain::new()),
            Arc::new(Vec::new()),
            provider.clone(),
            schedule,
            LoopConfig::default(),
        );

        let mut ctx = SharedContext::new();
        let mut delta = TurnDelta::new();
        delta.attribute_to("only");
        ctx.apply(delta);

        let (_tx, mut rx) = watch_pair();
        let result = exec
            .run(registry.agent("Echo").unwrap(), "hi", &mut ctx, &mut rx)
            .await
            .unwrap();

        assert_eq!(result.abort_reason(), Some(&AbortReason::PhaseComplete));
        assert!(provider.requests().is_empty());
    }
}
