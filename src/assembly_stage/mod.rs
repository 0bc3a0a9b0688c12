//! # Assembly Stage
//!
//! Consumes [`AssembleOrder`](crate::model::AssembleOrder) from the assembly
//! queue, spends the configured work time on it, and forwards a
//! [`ShipOrder`](crate::model::ShipOrder) for the same order id to the
//! shipping queue.
//!
//! ## Structure
//!
//! - [`handler`] - [`AssemblyHandler`], the stage's processing function
//! - [`address`] - [`AddressGenerator`] for synthetic delivery addresses
//! - [`error`] - [`AssemblyError`]
//! - [`new()`] - Factory wiring the handler into a [`PipelineStage`]
//!
//! ## Usage
//!
//! ```rust
//! use order_pipeline::assembly_stage;
//! use order_pipeline::config::PipelineConfig;
//! use stage_framework::{InMemoryBroker, StageState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = InMemoryBroker::new("docs");
//!     let config = PipelineConfig::default();
//!     let (stage, mut monitor) = assembly_stage::new(broker.connect(), &config);
//!
//!     let shutdown = CancellationToken::new();
//!     let handle = tokio::spawn(stage.run(shutdown.clone()));
//!     assert_eq!(monitor.wait_for(StageState::Processing).await, StageState::Processing);
//!
//!     shutdown.cancel();
//!     handle.await.unwrap().unwrap();
//! }
//! ```

pub mod address;
pub mod error;
pub mod handler;

pub use address::AddressGenerator;
pub use error::*;
pub use handler::AssemblyHandler;

use crate::config::PipelineConfig;
use stage_framework::{PipelineStage, QueueClient, StageMonitor};

pub const STAGE_NAME: &str = "assembly";

/// Random stream the assembly stage draws addresses from.
pub const RNG_STREAM: u64 = 1;

/// Creates the assembly stage on `connection`.
pub fn new(
    connection: impl QueueClient + 'static,
    config: &PipelineConfig,
) -> (PipelineStage<AssemblyHandler>, StageMonitor) {
    let handler = AssemblyHandler::new(
        config.assembly_work(),
        AddressGenerator::new(config.rng(RNG_STREAM)),
    );
    let options = config
        .stage_options(STAGE_NAME, &config.assembly_queue)
        .forward_to(&config.shipping_queue);
    PipelineStage::new(connection, handler, options)
}
