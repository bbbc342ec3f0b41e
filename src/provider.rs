//! # Model provider seam
//!
//! The inference call is an external collaborator behind the
//! [`ModelProvider`] trait: the loop hands it the instruction-primed message
//! list and the advertised tools, and gets back a [`ModelResponse`] plus
//! token [`Usage`]. [`OpenAIProvider`] wraps async-openai for production;
//! [`ScriptedProvider`] replays a queue of canned responses for tests and
//! deterministic pipelines, recording what it was asked so assertions can
//! inspect the exact transcript an agent saw.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionObjectArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EnsembleError, Result};
use crate::items::{Message, ModelResponse, Role, ToolCall};
use crate::tool::Tool;

/// Token usage for a single provider call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Trait for model providers
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a completion for the given transcript and advertised tools.
    async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<(ModelResponse, Usage)>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// OpenAI model provider using async-openai
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Create with a custom client
    pub fn with_client(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

}

/// Maps a transcript message onto the chat-completion request shape.
fn to_request_message(msg: &Message) -> ChatCompletionRequestMessage {
    match msg.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(msg.content.clone())
            .build()
            .unwrap()
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(msg.content.clone())
            .build()
            .unwrap()
            .into(),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            builder.content(msg.content.clone());
            if let Some(calls) = &msg.tool_calls {
                builder.tool_calls(
                    calls.iter().map(to_request_tool_call).collect::<Vec<_>>(),
                );
            }
            builder.build().unwrap().into()
        }
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .content(msg.content.clone())
            .tool_call_id(msg.tool_call_id.clone().unwrap_or_default())
            .build()
            .unwrap()
            .into(),
    }
}

fn to_request_tool_call(call: &ToolCall) -> async_openai::types::ChatCompletionMessageToolCall {
    async_openai::types::ChatCompletionMessageToolCall {
        id: call.id.clone(),
        r#type: ChatCompletionToolType::Function,
        function: async_openai::types::FunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.to_string(),
        },
    }
}

/// Advertises the registered capabilities as chat-completion tools.
fn to_request_tools(tools: &[Arc<dyn Tool>]) -> Vec<ChatCompletionTool> {
    tools
        .iter()
        .map(|tool| {
            ChatCompletionToolArgs::default()
                .r#type(ChatCompletionToolType::Function)
                .function(
                    FunctionObjectArgs::default()
                        .name(tool.name())
                        .description(tool.description())
                        .parameters(tool.parameters_schema())
                        .build()
                        .unwrap(),
                )
                .build()
                .unwrap()
        })
        .collect()
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<(ModelResponse, Usage)> {
        let openai_messages: Vec<ChatCompletionRequestMessage> =
            messages.iter().map(to_request_message).collect();

        let mut request = CreateChatCompletionRequestArgs::default();
        request.model(&self.model).messages(openai_messages);

        if !tools.is_empty() {
            request.tools(to_request_tools(&tools));
        }

        if let Some(temp) = self.temperature {
            request.temperature(temp);
        }

        if let Some(max) = self.max_tokens {
            request.max_tokens(max);
        }

        let request = request
            .build()
            .map_err(|e| EnsembleError::provider(e.to_string()))?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| EnsembleError::provider(e.to_string()))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| EnsembleError::provider("no choices in response"))?;

        let tool_calls = if let Some(tool_calls) = &choice.message.tool_calls {
            tool_calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: serde_json::from_str(&tc.function.arguments)
                        .unwrap_or(Value::Null),
                })
                .collect()
        } else {
            vec![]
        };

        let model_response = ModelResponse {
            id: response.id.clone(),
            content: choice.message.content.clone(),
            tool_calls,
            finish_reason: choice.finish_reason.as_ref().map(|r| format!("{:?}", r)),
            created_at: chrono::Utc::now(),
        };

        let usage = if let Some(usage) = response.usage {
            Usage::new(
                usage.prompt_tokens as usize,
                usage.completion_tokens as usize,
            )
        } else {
            Usage::empty()
        };

        Ok((model_response, usage))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

enum ScriptStep {
    Reply(ModelResponse),
    Fail(String),
}

/// Deterministic provider replaying a queued script.
///
/// Each `complete` call pops the next step; an exhausted script is a
/// provider error, which keeps tests honest about how many calls a run
/// makes. Every request's message list is recorded for later inspection.
pub struct ScriptedProvider {
    model: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, response: ModelResponse) -> Self {
        self.steps.lock().unwrap().push_back(ScriptStep::Reply(response));
        self
    }

    /// Queues a plain final answer.
    pub fn with_message(self, content: impl Into<String>) -> Self {
        self.with_response(ModelResponse::new_message(content))
    }

    /// Queues a tool-call request.
    pub fn with_tool_call(self, tool_name: impl Into<String>, args: Value) -> Self {
        let tool_call = ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: tool_name.into(),
            arguments: args,
        };
        self.with_response(ModelResponse::new_tool_calls(vec![tool_call]))
    }

    /// Queues a handoff request to the named agent.
    pub fn with_handoff(self, target: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.with_tool_call(target, serde_json::json!({ "reason": reason }))
    }

    /// Queues an upstream failure.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.steps
            .lock()
            .unwrap()
            .push_back(ScriptStep::Fail(message.into()));
        self
    }

    /// Message lists received so far, one entry per `complete` call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(
        &self,
        messages: Vec<Message>,
        _tools: Vec<Arc<dyn Tool>>,
    ) -> Result<(ModelResponse, Usage)> {
        self.requests.lock().unwrap().push(messages);

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Reply(response)) => Ok((response, Usage::new(10, 5))),
            Some(ScriptStep::Fail(message)) => Err(EnsembleError::provider(message)),
            None => Err(EnsembleError::provider("script exhausted")),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
