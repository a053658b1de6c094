use bollard::errors::Error as BollardError; // Alias bollard error
use dbcontainers_common::ContainerError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like engine modules)
pub use bollard;
pub use dbcontainers_common as common;

pub mod instance;
pub mod readiness;
pub mod test_utils;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Image pull failed for {image}: {source}")]
    PullFailed {
        image: String,
        #[source]
        source: BollardError,
    },
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container inspect failed: {0}")]
    InspectFailed(#[source] BollardError),
    #[error("Exec failed: {0}")]
    ExecFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Instance {0} has not been started")]
    NotStarted(String),
    #[error("Internal executor error: {0}")]
    Internal(String),
}

// Implement conversion from ExecutorError to the common ContainerError
impl From<ExecutorError> for ContainerError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::NotStarted(name) => ContainerError::NotStarted(name),
            ExecutorError::ExecFailed(e) => ContainerError::Exec(e.to_string()),
            other => ContainerError::Docker(other.to_string()),
        }
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

pub use instance::DockerInstance;
pub use readiness::{ProbeType, ReadinessChecker, ReadinessConfig, ReadinessProbe, ReadinessStatus};
