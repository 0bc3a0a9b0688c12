//! Top-level error for running the pipeline.

use crate::config::ConfigError;
use crate::intake::IntakeError;
use stage_framework::{QueueError, StageError, StageState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Broker error: {0}")]
    Queue(#[from] QueueError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Stage {stage} did not start (state {state:?})")]
    NotStarted { stage: &'static str, state: StageState },

    #[error("Stage task failed: {0}")]
    TaskJoin(String),
}
