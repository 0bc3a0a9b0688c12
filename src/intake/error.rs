//! Error types for order intake.

use stage_framework::{QueueError, StageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    /// The assembly queue could not be checked or created.
    #[error(transparent)]
    Provisioning(#[from] StageError),

    #[error("Failed to publish order: {0}")]
    Publish(#[from] QueueError),

    #[error("Failed to serialize order: {0}")]
    Serialization(#[from] serde_json::Error),
}
