//! # Handoff payloads and the filter chain
//!
//! When control transfers from one agent to another, the conversation the
//! receiving agent will see crosses the boundary as a [`HandoffPayload`]:
//! the committed history, the items produced so far in the current turn, and
//! the new input. Before the target agent runs, the payload passes through
//! an ordered chain of pure transform filters.
//!
//! Filters may drop, reorder, truncate, or summarize items, but the payload
//! they return must still be structurally valid; the chain validates after
//! every filter and fails the handoff with a filter error otherwise. The
//! empty chain is the identity.
//!
//! ```rust
//! use ensemble::handoff::{FilterChain, HandoffPayload};
//! use ensemble::items::Message;
//!
//! // Keep only the last three items of prior history.
//! let mut chain = FilterChain::new();
//! chain.push(|mut payload: HandoffPayload| {
//!     let len = payload.prior_history.len();
//!     payload.prior_history = payload.prior_history.split_off(len.saturating_sub(3));
//!     payload
//! });
//!
//! let payload = HandoffPayload {
//!     prior_history: (0..5).map(|i| Message::user(format!("m{i}"))).collect(),
//!     pre_handoff_items: vec![],
//!     new_items: vec![Message::user("latest question")],
//! };
//!
//! let filtered = chain.apply(payload).unwrap();
//! assert_eq!(filtered.prior_history.len(), 3);
//! assert_eq!(filtered.prior_history[0].content, "m2");
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};
use crate::items::{Message, Role};

/// The conversation crossing a handoff boundary, in three ordered segments.
///
/// Concatenating the segments reconstructs the full transcript the receiving
/// agent sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffPayload {
    /// History committed in previous turns.
    pub prior_history: Vec<Message>,
    /// Items produced in the current turn before the handoff was requested.
    pub pre_handoff_items: Vec<Message>,
    /// The pending input the receiving agent must answer.
    pub new_items: Vec<Message>,
}

impl HandoffPayload {
    /// Flattens the three segments into the receiving agent's transcript.
    pub fn concat(self) -> Vec<Message> {
        let mut items = self.prior_history;
        items.extend(self.pre_handoff_items);
        items.extend(self.new_items);
        items
    }

    pub fn len(&self) -> usize {
        self.prior_history.len() + self.pre_handoff_items.len() + self.new_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks structural validity of every item.
    ///
    /// A tool message must carry its `tool_call_id`; an assistant message
    /// declaring tool calls must give each call a nonempty id and name.
    pub fn validate(&self) -> Result<()> {
        let segments = [
            ("prior_history", &self.prior_history),
            ("pre_handoff_items", &self.pre_handoff_items),
            ("new_items", &self.new_items),
        ];
        for (segment, items) in segments {
            for (idx, message) in items.iter().enumerate() {
                if message.role == Role::Tool
                    && message.tool_call_id.as_deref().unwrap_or("").is_empty()
                {
                    return Err(EnsembleError::filter(format!(
                        "{}[{}]: tool message without tool_call_id",
                        segment, idx
                    )));
                }
                if let Some(calls) = &message.tool_calls {
                    if message.role != Role::Assistant {
                        return Err(EnsembleError::filter(format!(
                            "{}[{}]: tool calls on a non-assistant message",
                            segment, idx
                        )));
                    }
                    for call in calls {
                        if call.id.is_empty() || call.name.is_empty() {
                            return Err(EnsembleError::filter(format!(
                                "{}[{}]: tool call with empty id or name",
                                segment, idx
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// A pure transform over a handoff payload.
///
/// Filters see only their payload argument; they must not read or write any
/// session state.
pub type HandoffFilter = Arc<dyn Fn(HandoffPayload) -> HandoffPayload + Send + Sync>;

/// Ordered chain of handoff filters, composed left to right in registration
/// order.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<HandoffFilter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter; chains apply in push order.
    pub fn push<F>(&mut self, filter: F)
    where
        F: Fn(HandoffPayload) -> HandoffPayload + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the payload through every filter, validating after each step.
    ///
    /// The input is validated first so a malformed payload is caught before
    /// any filter runs. An invalid intermediate result names the offending
    /// filter position.
    pub fn apply(&self, payload: HandoffPayload) -> Result<HandoffPayload> {
        payload.validate()?;
        let mut current = payload;
        for (idx, filter) in self.filters.iter().enumerate() {
            current = filter(current);
            current.validate().map_err(|e| {
                EnsembleError::filter(format!("filter {} produced an invalid payload: {}", idx, e))
            })?;
        }
        Ok(current)
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}
