//! # Stage Framework
//!
//! Building blocks for queue-backed pipeline workers. A pipeline is a chain of
//! stages, each consuming one queue and optionally producing to the next:
//!
//! ```text
//! producer ──► [queue A] ──► Stage 1 ──► [queue B] ──► Stage 2 (terminal)
//! ```
//!
//! Each stage gets at-least-once delivery with manual acknowledgment, exactly
//! one message in flight, automatic lock renewal while a handler runs,
//! correlation-id propagation to everything it forwards, and cooperative
//! shutdown through a `CancellationToken`.
//!
//! ## Architecture Overview
//!
//! 1. **Transport Layer** ([`QueueClient`], [`QueueSender`], [`QueueReceiver`]) -
//!    peek-lock broker traits, implemented in process by [`InMemoryBroker`]
//! 2. **Runtime Layer** ([`PipelineStage`]) - provisioning, the receive loop,
//!    settlement and the start/stop state machine
//! 3. **Business Layer** ([`StageHandler`]) - what a stage does with one message
//!
//! You implement the handler; the engine does the rest.
//!
//! ## Core Abstractions
//!
//! ### [`Contract`] - The Payload Schema
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use stage_framework::Contract;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! #[serde(rename_all = "PascalCase")]
//! struct ShipOrder {
//!     id: String,
//!     address: String,
//! }
//!
//! impl Contract for ShipOrder {
//!     const TYPE_TAG: &'static str = "ShipOrder";
//! }
//! ```
//!
//! ### [`StageHandler`] - The Business Logic
//!
//! Declares the inbound and outbound contracts and handles one decoded
//! message at a time. See [`PipelineStage`] for a complete example.
//!
//! ### [`ErrorHandler`] - Error Reporting
//!
//! Every recovered failure (bad payload, handler error, broker hiccup) is
//! passed to the stage's error handler. The default, [`TracingErrorHandler`],
//! logs it; tests can swap in [`mock::RecordingErrorHandler`].
//!
//! ## Delivery Semantics
//!
//! | Outcome                          | Settlement |
//! |----------------------------------|------------|
//! | Handled, forwarded if needed     | complete   |
//! | Payload fails to decode          | complete (dropped) |
//! | Handler returns an error         | complete (dropped) |
//! | Handler stopped by shutdown      | abandon    |
//! | Forward hits a transient error   | abandon    |
//! | Outbound queue rejects the send  | complete (dropped) |
//!
//! There is no deduplication: a message redelivered after a lost lock is
//! handled again.

pub mod broker;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod memory;
pub mod mock;
pub mod provisioner;
pub mod stage;
pub mod tracing;

pub use broker::{QueueAdmin, QueueClient, QueueReceiver, QueueSender};
pub use envelope::{new_message_id, Contract, Envelope, LockToken, NoForward, ReceivedMessage};
pub use error::{QueueError, StageError};
pub use handler::{
    Cancelled, ErrorContext, ErrorHandler, MessageContext, StageHandler, TracingErrorHandler,
};
pub use memory::{InMemoryBroker, InMemoryConnection, DEFAULT_LOCK_DURATION};
pub use provisioner::ensure_queue;
pub use stage::{
    PipelineStage, StageMonitor, StageOptions, StageState, StageStats, DEFAULT_MAX_LOCK_RENEWAL,
    DEFAULT_RECEIVE_WAIT, DEFAULT_TRANSPORT_RETRY_DELAY, MAX_CONCURRENT_CALLS,
};
