//! # Tool invocation
//!
//! Executes the tool calls an agent declares in a turn. Each call runs
//! through a small Tower service stack (base executor plus optional
//! per-call timeout layer); failures are retried a bounded number of times
//! with backoff, and every attempt is kept so the turn's diagnostic trace
//! shows exactly which calls failed before succeeding.
//!
//! Independent calls within one turn fan out concurrently (optionally
//! capped by a semaphore) and join before the invoker returns, so the
//! execution loop never observes a half-finished batch. Outcomes come back
//! in declaration order regardless of completion order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tower::{service_fn, util::BoxService, BoxError, Service, ServiceExt};
use tracing::{debug, warn};

use crate::items::ToolCall;
use crate::tool::Tool;

/// Request passed into the tool service stack.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub agent: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Response from the tool service stack. Execution failures travel as data
/// so the loop can feed them back to the agent instead of aborting.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub output: Value,
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Boxed service type the invoker composes layers onto.
pub type ToolStack = BoxService<ToolRequest, ToolResponse, BoxError>;

/// Base executor adapting `dyn Tool` to a Tower service.
#[derive(Clone)]
pub struct BaseToolService {
    tool: Arc<dyn Tool>,
}

impl BaseToolService {
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self { tool }
    }
}

impl Service<ToolRequest> for BaseToolService {
    type Response = ToolResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let tool = self.tool.clone();
        Box::pin(async move {
            match tool.execute(req.arguments).await {
                Ok(result) => {
                    if let Some(err) = result.error {
                        Ok(ToolResponse::error(err))
                    } else {
                        Ok(ToolResponse::success(result.output))
                    }
                }
                Err(e) => Ok(ToolResponse::error(e.to_string())),
            }
        })
    }
}

/// An object-safe layer over a boxed tool service.
pub trait ErasedToolLayer: Send + Sync {
    fn layer_boxed(&self, inner: ToolStack) -> ToolStack;
}

/// Per-call timeout layer. Expiry is an ordinary tool failure, which makes
/// it retryable like any other.
#[derive(Clone, Copy, Debug)]
pub struct BoxedTimeoutLayer {
    duration: Duration,
}

impl BoxedTimeoutLayer {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl ErasedToolLayer for BoxedTimeoutLayer {
    fn layer_boxed(&self, inner: ToolStack) -> ToolStack {
        let d = self.duration;
        let shared = Arc::new(tokio::sync::Mutex::new(inner));
        let svc = service_fn(move |req: ToolRequest| {
            let shared = shared.clone();
            async move {
                let mut inner = shared.lock().await;
                match timeout(d, inner.call(req)).await {
                    Ok(res) => res,
                    Err(_elapsed) => Ok(ToolResponse::error("tool call timed out")),
                }
            }
        });
        BoxService::new(svc)
    }
}

/// Builds the service stack for one tool call.
pub fn build_tool_stack(tool: Arc<dyn Tool>, layers: &[Arc<dyn ErasedToolLayer>]) -> ToolStack {
    let mut stack: ToolStack = BoxService::new(BaseToolService::new(tool));
    for layer in layers {
        stack = layer.layer_boxed(stack);
    }
    stack
}

/// Bounded retry with linearly growing backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub attempts: usize,
    /// Base delay; attempt `n` waits `n * backoff` before retrying.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(0),
        }
    }
}

impl RetryPolicy {
    pub fn times(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(0),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_before(&self, next_attempt: usize) -> Duration {
        self.backoff * next_attempt as u32
    }
}

/// Everything that happened for one declared call: one response per attempt,
/// the last being the one fed back to the agent.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub call: ToolCall,
    pub attempts: Vec<ToolResponse>,
}

impl CallOutcome {
    /// The response the loop feeds back to the agent.
    pub fn final_response(&self) -> &ToolResponse {
        self.attempts.last().expect("at least one attempt")
    }

    pub fn failed_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_error()).count()
    }
}

/// Executes the declared tool calls of one turn.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    retry: RetryPolicy,
    call_timeout: Option<Duration>,
    max_concurrency: Option<usize>,
}

impl Default for ToolInvoker {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: None,
            max_concurrency: None,
        }
    }
}

impl ToolInvoker {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Default::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    fn layers(&self) -> Vec<Arc<dyn ErasedToolLayer>> {
        match self.call_timeout {
            Some(d) => vec![Arc::new(BoxedTimeoutLayer::new(d))],
            None => Vec::new(),
        }
    }

    /// Runs every call, fanning out concurrently and joining before return.
    ///
    /// Outcomes are in declaration order. An unknown capability produces a
    /// single failed attempt without retries; retrying a name that cannot
    /// resolve would never succeed.
    pub async fn invoke_all(
        &self,
        agent: &str,
        calls: &[ToolCall],
        tools: &[Arc<dyn Tool>],
    ) -> Vec<CallOutcome> {
        let semaphore = self
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));
        let layers = self.layers();

        let futures_vec = calls
            .iter()
            .map(|call| {
                let tool = tools.iter().find(|t| t.name() == call.name).cloned();
                let call = call.clone();
                let agent = agent.to_string();
                let semaphore = semaphore.clone();
                let layers = layers.clone();
                let retry = self.retry;
                async move {
                    let _permit = match semaphore {
                        Some(sem) => Some(sem.acquire_owned().await.expect("semaphore")),
                        None => None,
                    };

                    let Some(tool) = tool else {
                        warn!(agent = %agent, tool = %call.name, "unknown tool capability");
                        return CallOutcome {
                            attempts: vec![ToolResponse::error(format!(
                                "unknown capability '{}'",
                                call.name
                            ))],
                            call,
                        };
                    };

                    let mut attempts = Vec::new();
                    for attempt in 1..=retry.attempts {
                        let stack = build_tool_stack(tool.clone(), &layers);
                        let req = ToolRequest {
                            agent: agent.clone(),
                            call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        };
                        let response = match stack.oneshot(req).await {
                            Ok(resp) => resp,
                            Err(e) => ToolResponse::error(e.to_string()),
                        };
                        let failed = response.is_error();
                        if failed {
                            debug!(
                                tool = %call.name,
                                attempt,
                                "tool attempt failed"
                            );
                        }
                        attempts.push(response);
                        if !failed {
                            break;
                        }
                        if attempt < retry.attempts {
                            sleep(retry.delay_before(attempt)).await;
                        }
                    }

                    CallOutcome { call, attempts }
                }
            })
            .collect::<Vec<_>>();

        join_all(futures_vec).await
    }
}
