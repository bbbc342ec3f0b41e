//! Named agents and tool capabilities
//!
//! The registry owns every [`AgentDef`] and every [`Tool`] an ensemble can
//! use. Agents reference tools by capability name; resolution happens here,
//! so a definition can be validated once at build time instead of failing
//! mid-conversation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::AgentDef;
use crate::context::ContextSnapshot;
use crate::error::{EnsembleError, Result};
use crate::items::Message;
use crate::tool::Tool;

/// Registry of agent definitions and tool capabilities.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentDef>>,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent definition. Names are unique.
    pub fn register_agent(&mut self, agent: AgentDef) -> Result<()> {
        let name = agent.name().to_string();
        if self.agents.contains_key(&name) {
            return Err(EnsembleError::config(format!(
                "agent '{}' is already registered",
                name
            )));
        }
        self.agents.insert(name, Arc::new(agent));
        Ok(())
    }

    /// Registers a tool capability under its own name.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(EnsembleError::config(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<Arc<AgentDef>> {
        self.agents.get(name).cloned()
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<AgentDef>> {
        self.agents.values()
    }

    /// Resolves an agent's declared tool set, in name order.
    ///
    /// Unknown names are a registration defect; `validate` catches them at
    /// build time, so resolution here silently skips.
    pub fn tools_for(&self, agent: &AgentDef) -> Vec<Arc<dyn Tool>> {
        agent
            .tool_set()
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    /// Handoff targets an agent may reach, with their descriptions.
    pub fn handoffs_for(&self, agent: &AgentDef) -> Vec<(String, String)> {
        agent
            .allowed_targets()
            .iter()
            .filter_map(|target| {
                self.agents.get(target).map(|def| {
                    let description = def
                        .handoff_description()
                        .unwrap_or("Specialized agent")
                        .to_string();
                    (target.clone(), description)
                })
            })
            .collect()
    }

    /// Checks every agent's tool set and handoff targets resolve.
    pub fn validate(&self) -> Result<()> {
        for agent in self.agents.values() {
            for tool in agent.tool_set() {
                if !self.tools.contains_key(tool) {
                    return Err(EnsembleError::config(format!(
                        "agent '{}' declares unknown tool '{}'",
                        agent.name(),
                        tool
                    )));
                }
            }
            for target in agent.allowed_targets() {
                if !self.agents.contains_key(target) {
                    return Err(EnsembleError::config(format!(
                        "agent '{}' declares unknown handoff target '{}'",
                        agent.name(),
                        target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Builds the system message for an agent: its generated instructions
    /// plus the tools and handoff targets it can use this turn.
    pub fn system_message(&self, agent: &AgentDef, snapshot: &ContextSnapshot) -> Message {
        let mut content = agent.instructions(snapshot);

        let tools = self.tools_for(agent);
        if !tools.is_empty() {
            content.push_str("\n\nYou have access to the following tools:\n");
            for tool in &tools {
                content.push_str(&format!("- {}: {}\n", tool.name(), tool.description()));
            }
        }

        let handoffs = self.handoffs_for(agent);
        if !handoffs.is_empty() {
            content.push_str("\n\nYou can hand off to the following agents:\n");
            for (name, description) in &handoffs {
                content.push_str(&format!("- {}: {}\n", name, description));
            }
        }

        Message::system(content)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agent_names())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedContext;
    use crate::tool::FunctionTool;

    fn weather_tool() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::simple(
            "get_weather",
            "Gets the weather for a location",
            |location: String| format!("{}: 25C, sunny", location),
        ))
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let mut registry = AgentRegistry::new();
        registry
            .register_agent(AgentDef::with_static_instructions("A", "x"))
            .unwrap();
        let err = registry
            .register_agent(AgentDef::with_static_instructions("A", "y"))
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Config { .. }));
    }

    #[test]
    fn test_validate_catches_unknown_tool_and_target() {
        let mut registry = AgentRegistry::new();
        registry
            .register_agent(
                AgentDef::with_static_instructions("A", "x").with_tool("missing"),
            )
            .unwrap();
        assert!(registry.validate().is_err());

        let mut registry = AgentRegistry::new();
        registry
            .register_agent(
                AgentDef::with_static_instructions("A", "x").allow_handoff_to("ghost"),
            )
            .unwrap();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_tools_for_resolves_declared_set() {
        let mut registry = AgentRegistry::new();
        registry.register_tool(weather_tool()).unwrap();
        registry
            .register_agent(
                AgentDef::with_static_instructions("A", "x").with_tool("get_weather"),
            )
            .unwrap();

        let agent = registry.agent("A").unwrap();
        let tools = registry.tools_for(&agent);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "get_weather");
    }

    #[test]
    fn test_system_message_lists_tools_and_handoffs() {
        let mut registry = AgentRegistry::new();
        registry.register_tool(weather_tool()).unwrap();
        registry
            .register_agent(
                AgentDef::with_static_instructions("Specialist", "Help with details.")
                    .with_handoff_description("Handles hard questions"),
            )
            .unwrap();
        registry
            .register_agent(
                AgentDef::with_static_instructions("Triage", "Route requests.")
                    .with_tool("get_weather")
                    .allow_handoff_to("Specialist"),
            )
            .unwrap();

        let triage = registry.agent("Triage").unwrap();
        let snapshot = SharedContext::new().snapshot();
        let msg = registry.system_message(&triage, &snapshot);

        assert!(msg.content.contains("Route requests."));
        assert!(msg.content.contains("get_weather"));
        assert!(msg.content.contains("Specialist: Handles hard questions"));
    }
}
