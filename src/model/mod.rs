//! Wire payloads exchanged between the stages, plus the fixed catalogs they draw from.

pub mod catalog;
pub mod order;
pub mod shipment;

pub use catalog::*;
pub use order::*;
pub use shipment::*;
