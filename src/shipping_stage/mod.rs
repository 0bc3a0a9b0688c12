//! # Shipping Stage
//!
//! Consumes [`ShipOrder`](crate::model::ShipOrder) from the shipping queue,
//! waits a random shipping time and logs `Bike shipped` with the order id and
//! address. Terminal: it forwards nothing.
//!
//! ## Structure
//!
//! - [`handler`] - [`ShippingHandler`]
//! - [`error`] - [`ShippingError`]
//! - [`new()`] - Factory wiring the handler into a [`PipelineStage`]

pub mod error;
pub mod handler;

pub use error::*;
pub use handler::ShippingHandler;

use crate::config::PipelineConfig;
use stage_framework::{PipelineStage, QueueClient, StageMonitor};

pub const STAGE_NAME: &str = "shipping";

/// Random stream the shipping stage draws its delays from.
pub const RNG_STREAM: u64 = 2;

/// Creates the shipping stage on `connection`.
pub fn new(
    connection: impl QueueClient + 'static,
    config: &PipelineConfig,
) -> (PipelineStage<ShippingHandler>, StageMonitor) {
    let (min_work, max_work) = config.shipping_work_range();
    let handler = ShippingHandler::new(min_work, max_work, config.rng(RNG_STREAM));
    let options = config.stage_options(STAGE_NAME, &config.shipping_queue);
    PipelineStage::new(connection, handler, options)
}
