//! # Framework Errors
//!
//! Two layers of errors live here. [`QueueError`] is what a broker reports for a
//! single operation. [`StageError`] is the taxonomy a pipeline stage records while
//! it runs; every variant maps onto one recovery policy (see [`StageError::kind`]).

/// Errors reported by a queue broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),
    #[error("Queue already exists: {0}")]
    AlreadyExists(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Message lock lost for {message_id}")]
    LockLost { message_id: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Broker connection closed")]
    ConnectionClosed,
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
}

impl QueueError {
    /// True for failures that may clear up on redelivery. A forward that fails
    /// with a transient error abandons the inbound message; any other failure
    /// drops it.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transport(_) | QueueError::LockLost { .. })
    }
}

/// Errors recorded by a [`PipelineStage`](crate::PipelineStage).
///
/// | kind | policy |
/// |---|---|
/// | `Provisioning` | fatal to startup, stage goes to `Failed` |
/// | `Deserialization` | logged, message acknowledged and dropped |
/// | `Processing` | logged, message acknowledged and dropped |
/// | `Transport` | logged, loop continues |
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Provisioning of queue '{queue}' failed: {source}")]
    Provisioning {
        queue: String,
        #[source]
        source: QueueError,
    },
    #[error("Message {message_id} does not match contract {contract}: {reason}")]
    Deserialization {
        message_id: String,
        contract: &'static str,
        reason: String,
    },
    #[error("Processing of message {message_id} failed: {source}")]
    Processing {
        message_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Transport(#[from] QueueError),
    #[error("Outbound payload could not be serialized: {0}")]
    Serialization(String),
    #[error("Handler produced a payload for message {message_id} but the stage has no outbound queue")]
    MissingOutbound { message_id: String },
}

impl StageError {
    /// The taxonomy name used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Provisioning { .. } => "provisioning",
            StageError::Deserialization { .. } => "deserialization",
            StageError::Processing { .. } => "processing",
            StageError::Transport(_) => "transport",
            StageError::Serialization(_) => "serialization",
            StageError::MissingOutbound { .. } => "missing_outbound",
        }
    }
}
