//! # Order Pipeline
//!
//! A bike shop's order fulfillment, built on [`stage_framework`]. A purchase
//! becomes an `AssembleOrder` message; the assembly stage builds the bike and
//! forwards a `ShipOrder`; the shipping stage ships it.
//!
//! - [`model`] - wire payloads and catalogs
//! - [`assembly_stage`] / [`shipping_stage`] - the two stage handlers and their factories
//! - [`intake`] - publishes orders, generates synthetic ones
//! - [`config`] - layered configuration
//! - [`lifecycle`] - runs everything together

pub mod assembly_stage;
pub mod config;
pub mod error;
pub mod intake;
pub mod lifecycle;
pub mod model;
pub mod shipping_stage;

pub use error::PipelineError;
