//! Error types for the saestack system

use thiserror::Error;

/// Main error type for saestack operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, detected before any computation starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structural error in computation-graph assembly or evaluation
    #[error("Graph error: {0}")]
    Graph(String),

    /// Shape mismatch between connected modules or data
    #[error("Dimension mismatch: {0}")]
    Dimension(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Data(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for saestack operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a structural graph error
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Create a dimension-mismatch error
    pub fn dimension(msg: impl Into<String>) -> Self {
        Self::Dimension(msg.into())
    }

    /// Create a dataset error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}
