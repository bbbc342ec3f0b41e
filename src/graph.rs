//! Handoff graph introspection
//!
//! Handoff declarations form a directed graph over agents, and real
//! configurations are frequently cyclic (triage hands to a specialist, the
//! specialist hands back). Introspection therefore always traverses with a
//! visited set; the execution loop's turn bound is the independent safety
//! net at runtime.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EnsembleError, Result};
use crate::registry::AgentRegistry;

/// Directed graph of declared handoff edges.
#[derive(Debug, Clone, Default)]
pub struct HandoffGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl HandoffGraph {
    pub fn from_registry(registry: &AgentRegistry) -> Self {
        let mut edges = BTreeMap::new();
        for agent in registry.agents() {
            edges.insert(
                agent.name().to_string(),
                agent.allowed_targets().clone(),
            );
        }
        Self { edges }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn targets_of(&self, agent: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(agent)
    }

    /// Every edge must point at a node of the graph.
    pub fn validate(&self) -> Result<()> {
        for (from, targets) in &self.edges {
            for to in targets {
                if !self.edges.contains_key(to) {
                    return Err(EnsembleError::config(format!(
                        "handoff edge {} -> {} points at an unregistered agent",
                        from, to
                    )));
                }
            }
        }
        Ok(())
    }

    /// Agents reachable from `start` by following handoff edges, excluding
    /// `start` itself unless a cycle leads back to it. Cycle-safe.
    pub fn reachable_from(&self, start: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<&str> = vec![start];
        let mut reachable = BTreeSet::new();

        while let Some(node) = stack.pop() {
            if !visited.insert(node.to_string()) {
                continue;
            }
            if let Some(targets) = self.edges.get(node) {
                for target in targets {
                    reachable.insert(target.clone());
                    stack.push(target);
                }
            }
        }
        reachable
    }

    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        self.reachable_from(from).contains(to)
    }
}
