//! Container engine error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The engine command ran and reported failure.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Volume was not found.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Dockerfile for a lesson image is missing.
    #[error("no Dockerfile for image {image} at {path}")]
    MissingDockerfile { image: String, path: String },

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine binary could not be executed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// True when the error means the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_) | ContainerError::VolumeNotFound(_)
        )
    }
}
