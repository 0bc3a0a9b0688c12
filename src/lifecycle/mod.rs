//! # Pipeline Lifecycle
//!
//! Starting, wiring and stopping the stages of the pipeline.
//!
//! ```text
//! OrderIntake ──► [crazybike-assembler] ──► assembly ──► [crazybike-shipper] ──► shipping
//! ```
//!
//! [`PipelineSystem::start`] creates one broker connection per stage, spawns
//! each stage in its own Tokio task and waits until both are processing.
//! [`PipelineSystem::shutdown`] cancels the shared token, closes the intake and
//! awaits every stage, returning their counters in a [`PipelineReport`].
//!
//! Observability is set up separately with [`setup_tracing`], once per process.

pub mod pipeline_system;

pub use pipeline_system::{wait_until_processing, PipelineReport, PipelineSystem};
pub use stage_framework::tracing::setup_tracing;
