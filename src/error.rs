//! Error types for the orchestration runtime

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Main error type for the orchestration runtime
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// No valid or allowed handoff target could be resolved
    #[error("routing error: {message}")]
    Routing { message: String },

    /// A handoff payload was structurally invalid after filtering
    #[error("handoff filter error: {message}")]
    Filter { message: String },

    /// A tool capability failed to execute
    #[error("tool error: {message}")]
    Tool { message: String },

    /// Upstream inference failure
    #[error("provider error: {message}")]
    Provider { message: String },

    /// Session lookup or lifecycle error
    #[error("session error: {0}")]
    Session(String),

    /// Invalid registration or builder configuration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl EnsembleError {
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
