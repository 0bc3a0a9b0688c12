//! # Broker Traits
//!
//! The seams between a stage and whatever queue broker carries its messages.
//! A broker is split the same way hosted queue services split their SDKs:
//!
//! - [`QueueAdmin`] checks and creates queues (used by the provisioner).
//! - [`QueueClient`] is the connection; it opens senders and receivers and is
//!   closed when the owner is done with it.
//! - [`QueueSender`] and [`QueueReceiver`] are handles owned by exactly one
//!   stage for its lifetime.
//!
//! Receivers use peek-lock: a received message stays on the queue, locked to
//! the receiver, until it is completed or abandoned or its lock runs out.

use crate::envelope::{Envelope, ReceivedMessage};
use crate::error::QueueError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait QueueAdmin: Send + Sync {
    async fn queue_exists(&self, queue: &str) -> Result<bool, QueueError>;

    /// Fails with [`QueueError::AlreadyExists`] when the queue is already there.
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueClient: QueueAdmin {
    async fn sender(&self, queue: &str) -> Result<Box<dyn QueueSender>, QueueError>;

    async fn receiver(&self, queue: &str) -> Result<Box<dyn QueueReceiver>, QueueError>;

    /// Releases the connection. Handles opened from it stop working.
    async fn close(&self) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueSender: Send + Sync {
    fn queue(&self) -> &str;

    async fn send(&self, envelope: Envelope) -> Result<(), QueueError>;

    async fn close(&mut self) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueReceiver: Send + Sync {
    fn queue(&self) -> &str;

    /// Waits up to `max_wait` for the next message. `Ok(None)` means nothing
    /// arrived in time. Dropping the future before it resolves loses nothing.
    async fn receive(&mut self, max_wait: Duration) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Acknowledges the message; the broker removes it for good.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Gives the message back for redelivery without waiting for the lock to expire.
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Extends the lock and returns the new expiry.
    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Instant, QueueError>;

    async fn close(&mut self) -> Result<(), QueueError>;
}
