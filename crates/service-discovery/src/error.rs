//! Error types for service discovery

use crate::coordinator::CoordinatorError;
use thiserror::Error;

/// Service discovery error type
#[derive(Error, Debug)]
pub enum Error {
    /// Error returned by the coordination service, passed through unmodified
    #[error("Coordination service error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// An instance record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A selection strategy found no instance to hand out
    #[error("No instances available for service: {0}")]
    NoInstances(String),

    /// An instance record failed validation
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether this error reports a missing coordination node
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Coordinator(e) if e.is_not_found())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
