//! Tool capabilities
//!
//! A tool is a declared external capability an agent may request by name.
//! The runtime knows the name, a description for the advertising prompt, a
//! JSON parameter schema, and how to execute the call; the bodies themselves
//! (weather lookups, arithmetic, search) are external collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;

/// A named capability the invoker can execute.
#[async_trait]
pub trait Tool: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Shown to the agent when the capability is advertised.
    fn description(&self) -> &str;

    /// JSON schema of the arguments the capability accepts.
    fn parameters_schema(&self) -> Value;

    /// Runs the capability. An execution failure is carried in the returned
    /// [`ToolResult`], not the `Err` channel, so the loop can feed it back
    /// to the agent.
    async fn execute(&self, arguments: Value) -> Result<ToolResult>;
}

/// What came back from one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    /// Set when the capability failed; `output` is `Null` in that case.
    pub error: Option<String>,
}

impl ToolResult {
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

/// Adapts a plain closure into a [`Tool`].
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters_schema: Value,
    function: Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>,
}

impl FunctionTool {
    pub fn new<F>(name: String, description: String, parameters_schema: Value, function: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name,
            description,
            parameters_schema,
            function: Arc::new(function),
        }
    }

    /// Wraps a string-to-string closure; arguments arrive as `{"input": …}`.
    pub fn simple<F>(name: &str, description: &str, function: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "Input to the function"
                }
            },
            "required": ["input"]
        });
        Self::new(
            name.to_string(),
            description.to_string(),
            schema,
            move |args: Value| {
                let input = args
                    .get("input")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(Value::String(function(input.to_string())))
            },
        )
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters_schema.clone()
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult> {
        match (self.function)(arguments) {
            Ok(output) => Ok(ToolResult::success(output)),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters_schema", &self.parameters_schema)
            .finish()
    }
}
