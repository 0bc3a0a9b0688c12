//! Error types for the Assembly stage.

use crate::model::OrderDefect;
use stage_framework::Cancelled;
use thiserror::Error;

/// Errors the assembly handler can return for one order.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AssemblyError {
    /// The order does not describe a bike that can be built.
    #[error("Order {order_id} cannot be assembled: {defect}")]
    InvalidOrder { order_id: String, defect: OrderDefect },

    /// The stage shut down while the bike was on the bench.
    #[error("Assembly interrupted")]
    Interrupted(#[from] Cancelled),
}
