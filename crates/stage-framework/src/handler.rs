//! # StageHandler Trait
//!
//! The `StageHandler` trait is the business half of a pipeline stage: it says
//! what payload a stage consumes, what it forwards, and what it does with each
//! message. The [`PipelineStage`](crate::PipelineStage) engine supplies
//! everything else (queues, leases, acknowledgment, shutdown).
//!
//! Alongside it sits [`ErrorHandler`], the callback a stage reports recovered
//! failures to. Both are passed in when the stage is built; there is no event
//! subscription list to mutate afterwards.

use crate::error::StageError;
use crate::envelope::Contract;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Processing function of a stage.
///
/// # Forwarding
/// Returning `Ok(Some(payload))` forwards `payload` to the stage's outbound
/// queue under the inbound message's correlation id. Terminal stages set
/// `Outbound = NoForward` and always return `Ok(None)`.
///
/// # Failure
/// An `Err` is reported to the stage's [`ErrorHandler`] and the message is
/// acknowledged anyway; it is not retried. The one exception is an error
/// returned after [`MessageContext::cancellation`] fired: the stage then
/// abandons the message so another consumer picks it up.
///
/// # Exclusivity
/// `handle` takes `&mut self` and the engine never calls it again before the
/// previous call returned, so handler state needs no locking.
#[async_trait]
pub trait StageHandler: Send + 'static {
    type Inbound: Contract;
    type Outbound: Contract;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(
        &mut self,
        message: Self::Inbound,
        ctx: &MessageContext,
    ) -> Result<Option<Self::Outbound>, Self::Error>;
}

/// Per-message context. A fresh one is built for every delivery.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: String,
    pub correlation_id: String,
    pub delivery_count: u32,
    cancellation: CancellationToken,
}

/// Returned by [`MessageContext::sleep`] when the stage is shutting down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cancelled while processing")]
pub struct Cancelled;

impl MessageContext {
    pub fn new(
        message_id: impl Into<String>,
        correlation_id: impl Into<String>,
        delivery_count: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            correlation_id: correlation_id.into(),
            delivery_count,
            cancellation,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Sleeps for `duration` unless the stage is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            _ = self.cancellation.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Where an error happened.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub stage: &'a str,
    pub queue: &'a str,
    pub message_id: Option<&'a str>,
    pub correlation_id: Option<&'a str>,
}

/// Receives every error a stage records. Must not block.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &StageError, ctx: &ErrorContext<'_>);
}

/// Default [`ErrorHandler`]: one structured `error!` event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn on_error(&self, err: &StageError, ctx: &ErrorContext<'_>) {
        error!(
            stage = ctx.stage,
            queue = ctx.queue,
            kind = err.kind(),
            message_id = ctx.message_id.unwrap_or("-"),
            correlation_id = ctx.correlation_id.unwrap_or("-"),
            error = %err,
            "Stage error"
        );
    }
}
