//! # Pipeline Stage
//!
//! `PipelineStage` is the engine every worker in the pipeline runs on. It owns
//! one inbound receiver, at most one outbound sender and the broker connection
//! they came from, and drives them through a fixed lifecycle:
//!
//! ```text
//! Created ──► Starting ──► Processing ──► Draining ──► Stopped
//!                │
//!                └──► Failed   (provisioning rejected)
//! ```
//!
//! ## Message cycle
//!
//! For each delivery: decode the body into `H::Inbound`, call the handler,
//! forward its output (if any) under the same correlation id, then complete the
//! inbound message. Decode and handler failures are reported and the message is
//! completed anyway, which drops it.
//!
//! ## Concurrency
//!
//! Exactly one message is in flight per stage. The next `receive` is not issued
//! until the current message is settled, so a stage handles messages strictly
//! in the order it received them. Several stages may share one queue; the
//! broker decides which of them gets each message.
//!
//! ## Shutdown
//!
//! The `shutdown` token passed to [`PipelineStage::run`] interrupts a pending
//! receive, a retry back-off, an outbound send, and (through
//! [`MessageContext`]) any delay inside the handler. A message whose handler
//! gives up because of cancellation is abandoned, never forwarded.

use crate::broker::{QueueClient, QueueReceiver, QueueSender};
use crate::envelope::{Envelope, ReceivedMessage};
use crate::error::StageError;
use crate::handler::{ErrorContext, ErrorHandler, MessageContext, StageHandler, TracingErrorHandler};
use crate::provisioner::ensure_queue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// In-flight messages per stage instance. The engine is built around this being one.
pub const MAX_CONCURRENT_CALLS: usize = 1;

/// How long a single message may keep its lock renewed.
pub const DEFAULT_MAX_LOCK_RENEWAL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

pub const DEFAULT_TRANSPORT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Static wiring of a stage. Read-only once the stage runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOptions {
    pub name: String,
    pub inbound_queue: String,
    pub outbound_queue: Option<String>,
    pub max_lock_renewal: Duration,
    pub receive_wait: Duration,
    pub transport_retry_delay: Duration,
}

impl StageOptions {
    pub fn new(name: impl Into<String>, inbound_queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inbound_queue: inbound_queue.into(),
            outbound_queue: None,
            max_lock_renewal: DEFAULT_MAX_LOCK_RENEWAL,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            transport_retry_delay: DEFAULT_TRANSPORT_RETRY_DELAY,
        }
    }

    pub fn forward_to(mut self, outbound_queue: impl Into<String>) -> Self {
        self.outbound_queue = Some(outbound_queue.into());
        self
    }

    pub fn with_max_lock_renewal(mut self, max_lock_renewal: Duration) -> Self {
        self.max_lock_renewal = max_lock_renewal;
        self
    }

    pub fn with_receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }

    pub fn with_transport_retry_delay(mut self, delay: Duration) -> Self {
        self.transport_retry_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Starting,
    Processing,
    Draining,
    Stopped,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Stopped | StageState::Failed)
    }
}

/// Counters a stage returns when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStats {
    pub received: u64,
    /// Handled successfully and completed.
    pub processed: u64,
    pub forwarded: u64,
    /// Completed without success (decode or handler failure).
    pub dropped: u64,
    /// Given back to the broker for redelivery.
    pub abandoned: u64,
    pub lock_renewals: u64,
    pub transport_errors: u64,
}

/// Read side of a stage's lifecycle, handed out by [`PipelineStage::new`].
#[derive(Debug, Clone)]
pub struct StageMonitor {
    state: watch::Receiver<StageState>,
}

impl StageMonitor {
    pub fn state(&self) -> StageState {
        *self.state.borrow()
    }

    /// Waits until the stage reaches `target` or a terminal state, and
    /// returns the state it reached.
    pub async fn wait_for(&mut self, target: StageState) -> StageState {
        let reached = match self
            .state
            .wait_for(|state| *state == target || state.is_terminal())
            .await
        {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| *self.state.borrow())
    }
}

/// A queue-backed worker parameterized by its [`StageHandler`].
///
/// # Usage
///
/// ```rust
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// use stage_framework::{
///     Contract, InMemoryBroker, MessageContext, NoForward, PipelineStage, StageHandler,
///     StageOptions,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Greeting { name: String }
/// impl Contract for Greeting { const TYPE_TAG: &'static str = "Greeting"; }
///
/// struct Greeter;
///
/// #[async_trait]
/// impl StageHandler for Greeter {
///     type Inbound = Greeting;
///     type Outbound = NoForward;
///     type Error = std::convert::Infallible;
///
///     async fn handle(&mut self, msg: Greeting, _ctx: &MessageContext) -> Result<Option<NoForward>, Self::Error> {
///         println!("hello {}", msg.name);
///         Ok(None)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let broker = InMemoryBroker::new("demo");
///     let (stage, mut monitor) =
///         PipelineStage::new(broker.connect(), Greeter, StageOptions::new("greeter", "greetings"));
///
///     let shutdown = CancellationToken::new();
///     let handle = tokio::spawn(stage.run(shutdown.clone()));
///
///     monitor.wait_for(stage_framework::StageState::Processing).await;
///     shutdown.cancel();
///     let stats = handle.await.unwrap().unwrap();
///     assert_eq!(stats.received, 0);
/// }
/// ```
pub struct PipelineStage<H: StageHandler> {
    options: StageOptions,
    handler: H,
    connection: Box<dyn QueueClient>,
    errors: Arc<dyn ErrorHandler>,
    state: watch::Sender<StageState>,
    host: Option<CancellationToken>,
}

impl<H: StageHandler> PipelineStage<H> {
    /// Creates a stage in the `Created` state together with its monitor.
    ///
    /// The stage takes ownership of `connection`; it is closed when the stage stops.
    pub fn new(
        connection: impl QueueClient + 'static,
        handler: H,
        options: StageOptions,
    ) -> (Self, StageMonitor) {
        let (state, receiver) = watch::channel(StageState::Created);
        let stage = Self {
            options,
            handler,
            connection: Box::new(connection),
            errors: Arc::new(TracingErrorHandler),
            state,
            host: None,
        };
        (stage, StageMonitor { state: receiver })
    }

    /// Replaces the default [`TracingErrorHandler`].
    pub fn with_error_handler(mut self, errors: impl ErrorHandler + 'static) -> Self {
        self.errors = Arc::new(errors);
        self
    }

    /// Token cancelled when this stage stops or fails, so the hosting
    /// process can shut down with it.
    pub fn with_host_signal(mut self, host: CancellationToken) -> Self {
        self.host = Some(host);
        self
    }

    /// Runs the stage until `shutdown` is cancelled.
    ///
    /// Returns `Err` only if startup failed; everything after that is
    /// reported to the error handler and the stage keeps going.
    pub async fn run(self, shutdown: CancellationToken) -> Result<StageStats, StageError> {
        let span = info_span!("stage", stage = %self.options.name);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, shutdown: CancellationToken) -> Result<StageStats, StageError> {
        let Self {
            options,
            mut handler,
            connection,
            errors,
            state,
            host,
        } = self;

        let mut cycle = Cycle {
            options: &options,
            errors: &*errors,
            state: &state,
            shutdown: &shutdown,
            stats: StageStats::default(),
        };

        cycle.transition(StageState::Starting);
        let (mut receiver, mut sender) = match open_handles(&options, connection.as_ref()).await {
            Ok(handles) => handles,
            Err(e) => {
                cycle.report(&e, None);
                if let Err(close) = connection.close().await {
                    cycle.report(&StageError::Transport(close), None);
                }
                cycle.transition(StageState::Failed);
                if let Some(host) = &host {
                    host.cancel();
                }
                return Err(e);
            }
        };

        cycle.transition(StageState::Processing);
        cycle
            .consume(&mut handler, &mut *receiver, sender.as_deref())
            .await;

        cycle.transition(StageState::Draining);
        if let Some(sender) = sender.as_mut() {
            if let Err(e) = sender.close().await {
                cycle.report(&StageError::Transport(e), None);
            }
        }
        drop(sender);
        if let Err(e) = receiver.close().await {
            cycle.report(&StageError::Transport(e), None);
        }
        drop(receiver);
        if let Err(e) = connection.close().await {
            cycle.report(&StageError::Transport(e), None);
        }

        cycle.transition(StageState::Stopped);
        info!(stats = ?cycle.stats, "Stage stopped");
        if let Some(host) = &host {
            host.cancel();
        }
        Ok(cycle.stats)
    }
}

type Handles = (Box<dyn QueueReceiver>, Option<Box<dyn QueueSender>>);

/// Provisions both queues, then opens the receiver and sender on them.
async fn open_handles(
    options: &StageOptions,
    connection: &dyn QueueClient,
) -> Result<Handles, StageError> {
    ensure_queue(connection, &options.inbound_queue).await?;
    if let Some(outbound) = &options.outbound_queue {
        ensure_queue(connection, outbound).await?;
    }

    let receiver = connection
        .receiver(&options.inbound_queue)
        .await
        .map_err(|source| StageError::Provisioning {
            queue: options.inbound_queue.clone(),
            source,
        })?;
    let sender = match &options.outbound_queue {
        Some(outbound) => Some(connection.sender(outbound).await.map_err(|source| {
            StageError::Provisioning {
                queue: outbound.clone(),
                source,
            }
        })?),
        None => None,
    };
    Ok((receiver, sender))
}

/// How a message is settled with the broker once its handling is over.
enum Settlement {
    Processed,
    Dropped,
    Abandoned,
}

/// Everything the message cycle needs except the handler, which is borrowed
/// separately so the two can be used side by side.
struct Cycle<'a> {
    options: &'a StageOptions,
    errors: &'a dyn ErrorHandler,
    state: &'a watch::Sender<StageState>,
    shutdown: &'a CancellationToken,
    stats: StageStats,
}

impl Cycle<'_> {
    fn transition(&self, next: StageState) {
        let changed = self.state.send_if_modified(|state| {
            let allowed = match next {
                StageState::Draining => *state == StageState::Processing,
                _ => !state.is_terminal(),
            };
            if allowed && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(state = ?next, "Stage state changed");
        }
    }

    fn report(&self, err: &StageError, message: Option<&ReceivedMessage>) {
        let ctx = ErrorContext {
            stage: &self.options.name,
            queue: &self.options.inbound_queue,
            message_id: message.map(|m| m.message_id()),
            correlation_id: message.map(|m| m.correlation_id()),
        };
        self.errors.on_error(err, &ctx);
    }

    async fn consume<H: StageHandler>(
        &mut self,
        handler: &mut H,
        receiver: &mut dyn QueueReceiver,
        sender: Option<&dyn QueueSender>,
    ) {
        let shutdown = self.shutdown;
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = receiver.receive(self.options.receive_wait) => received,
            };

            match received {
                Ok(Some(message)) => self.process(handler, &*receiver, sender, message).await,
                // An empty wait may complete without suspending.
                Ok(None) => tokio::task::yield_now().await,
                Err(e) => {
                    self.stats.transport_errors += 1;
                    self.report(&StageError::Transport(e), None);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.transport_retry_delay) => {}
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn process<H: StageHandler>(
        &mut self,
        handler: &mut H,
        receiver: &dyn QueueReceiver,
        sender: Option<&dyn QueueSender>,
        message: ReceivedMessage,
    ) {
        self.stats.received += 1;
        debug!(
            message_id = message.message_id(),
            correlation_id = message.correlation_id(),
            delivery_count = message.delivery_count,
            body = %message.envelope.body_text(),
            "Received message"
        );

        let settlement = self.handle(handler, receiver, sender, &message).await;

        let result = match settlement {
            Settlement::Processed | Settlement::Dropped => receiver.complete(&message).await,
            Settlement::Abandoned => receiver.abandon(&message).await,
        };
        match (result, settlement) {
            (Err(e), _) => {
                self.stats.transport_errors += 1;
                self.report(&StageError::Transport(e), Some(&message));
            }
            (Ok(()), Settlement::Processed) => {
                self.stats.processed += 1;
                info!(message_id = message.message_id(), "Message processed");
            }
            (Ok(()), Settlement::Dropped) => {
                self.stats.dropped += 1;
                warn!(message_id = message.message_id(), "Message dropped");
            }
            (Ok(()), Settlement::Abandoned) => {
                self.stats.abandoned += 1;
                info!(message_id = message.message_id(), "Message abandoned");
            }
        }
    }

    async fn handle<H: StageHandler>(
        &mut self,
        handler: &mut H,
        receiver: &dyn QueueReceiver,
        sender: Option<&dyn QueueSender>,
        message: &ReceivedMessage,
    ) -> Settlement {
        let input = match message.envelope.decode::<H::Inbound>() {
            Ok(input) => input,
            Err(e) => {
                let err = StageError::Deserialization {
                    message_id: message.message_id().to_string(),
                    contract: <H::Inbound as crate::Contract>::TYPE_TAG,
                    reason: e.to_string(),
                };
                self.report(&err, Some(message));
                return Settlement::Dropped;
            }
        };

        let ctx = MessageContext::new(
            message.message_id(),
            message.correlation_id(),
            message.delivery_count,
            self.shutdown.clone(),
        );
        let outcome = self
            .with_lease_renewal(receiver, message, handler.handle(input, &ctx))
            .await;

        let output = match outcome {
            Ok(output) => output,
            Err(_) if ctx.is_cancelled() => return Settlement::Abandoned,
            Err(e) => {
                let err = StageError::Processing {
                    message_id: message.message_id().to_string(),
                    source: Box::new(e),
                };
                self.report(&err, Some(message));
                return Settlement::Dropped;
            }
        };

        match output {
            None => Settlement::Processed,
            Some(payload) => self.forward(sender, message, &payload).await,
        }
    }

    /// Drives `work` to completion while keeping the message's lock alive,
    /// for at most `max_lock_renewal` after the message arrived.
    async fn with_lease_renewal<F: Future>(
        &mut self,
        receiver: &dyn QueueReceiver,
        message: &ReceivedMessage,
        work: F,
    ) -> F::Output {
        tokio::pin!(work);
        let shutdown = self.shutdown;
        let renew_until = Instant::now() + self.options.max_lock_renewal;
        let mut locked_until = message.locked_until;
        let mut renewing = true;
        let mut draining = shutdown.is_cancelled();

        loop {
            let renew_at = renewal_point(Instant::now(), locked_until);
            let renew_due = renewing && renew_at < renew_until;
            tokio::select! {
                output = &mut work => return output,
                _ = shutdown.cancelled(), if !draining => {
                    draining = true;
                    self.transition(StageState::Draining);
                }
                _ = tokio::time::sleep_until(renew_at), if renew_due => {
                    match receiver.renew_lock(message).await {
                        Ok(until) => {
                            locked_until = until;
                            self.stats.lock_renewals += 1;
                            debug!(message_id = message.message_id(), "Lock renewed");
                        }
                        Err(e) => {
                            renewing = false;
                            self.stats.transport_errors += 1;
                            self.report(&StageError::Transport(e), Some(message));
                        }
                    }
                }
            }
        }
    }

    async fn forward<T: crate::Contract>(
        &mut self,
        sender: Option<&dyn QueueSender>,
        message: &ReceivedMessage,
        payload: &T,
    ) -> Settlement {
        let Some(sender) = sender else {
            let err = StageError::MissingOutbound {
                message_id: message.message_id().to_string(),
            };
            self.report(&err, Some(message));
            return Settlement::Dropped;
        };

        let envelope = match Envelope::for_contract(payload, message.correlation_id()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(&StageError::Serialization(e.to_string()), Some(message));
                return Settlement::Dropped;
            }
        };
        let outbound_id = envelope.message_id.clone();

        let sent = tokio::select! {
            biased;
            sent = sender.send(envelope) => sent,
            _ = self.shutdown.cancelled() => return Settlement::Abandoned,
        };
        match sent {
            Ok(()) => {
                self.stats.forwarded += 1;
                info!(
                    message_id = message.message_id(),
                    outbound_message_id = %outbound_id,
                    queue = sender.queue(),
                    "Forwarded"
                );
                Settlement::Processed
            }
            Err(e) => {
                self.stats.transport_errors += 1;
                let transient = e.is_transient();
                self.report(&StageError::Transport(e), Some(message));
                if transient {
                    Settlement::Abandoned
                } else {
                    warn!(
                        message_id = message.message_id(),
                        queue = sender.queue(),
                        "Outbound queue rejected the message"
                    );
                    Settlement::Dropped
                }
            }
        }
    }
}

/// Renew halfway between now and the current lock expiry.
fn renewal_point(now: Instant, locked_until: Instant) -> Instant {
    if locked_until <= now {
        now
    } else {
        now + (locked_until - now) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_point_is_halfway() {
        let now = Instant::now();
        let until = now + Duration::from_secs(60);
        assert_eq!(renewal_point(now, until), now + Duration::from_secs(30));
        assert_eq!(renewal_point(until, now), until);
    }

    #[test]
    fn test_options_builder() {
        let options = StageOptions::new("assembly", "in")
            .forward_to("out")
            .with_receive_wait(Duration::from_millis(5));
        assert_eq!(options.outbound_queue.as_deref(), Some("out"));
        assert_eq!(options.max_lock_renewal, DEFAULT_MAX_LOCK_RENEWAL);
        assert_eq!(options.receive_wait, Duration::from_millis(5));
    }

    #[test]
    fn test_terminal_states() {
        assert!(StageState::Stopped.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(!StageState::Draining.is_terminal());
    }
}
