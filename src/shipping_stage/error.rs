//! Error types for the Shipping stage.

use stage_framework::Cancelled;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ShippingError {
    #[error("Order {order_id} has no delivery address")]
    MissingAddress { order_id: String },

    #[error("Shipping interrupted")]
    Interrupted(#[from] Cancelled),
}
