//! # In-Memory Broker
//!
//! A process-local queue broker with the same peek-lock semantics a hosted
//! broker offers. [`InMemoryBroker`] plays the server; every owner gets its own
//! [`InMemoryConnection`] through [`InMemoryBroker::connect`], and opens
//! senders and receivers from that connection.
//!
//! All queue state sits behind one mutex, which is what arbitrates between
//! competing receivers on the same queue. The mutex is never held across an
//! `.await`; waiting receivers park on a [`Notify`] instead.
//!
//! The broker also counts queue creations and open handles so tests can
//! assert idempotent provisioning and clean shutdown.

use crate::broker::{QueueAdmin, QueueClient, QueueReceiver, QueueSender};
use crate::envelope::{Envelope, LockToken, ReceivedMessage};
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lock duration a fresh broker hands out with each delivery.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

const SCHEME: &str = "memory://";

#[derive(Debug)]
struct StoredMessage {
    envelope: Envelope,
    delivery_count: u32,
}

#[derive(Debug)]
struct LockedMessage {
    stored: StoredMessage,
    locked_until: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
}

impl QueueState {
    /// Moves messages whose lock ran out back to the head of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                trace!(message_id = %locked.stored.envelope.message_id, "Lock expired");
                self.ready.push_front(locked.stored);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.locked_until).min()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    creations: HashMap<String, usize>,
    open_connections: usize,
    open_senders: usize,
    open_receivers: usize,
}

#[derive(Debug)]
struct Shared {
    name: String,
    lock_duration: Duration,
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Taken {
    Message(ReceivedMessage),
    Empty { next_expiry: Option<Instant> },
}

/// A process-local broker. Cloning is cheap and every clone sees the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_lock_duration(name, DEFAULT_LOCK_DURATION)
    }

    pub fn with_lock_duration(name: impl Into<String>, lock_duration: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                lock_duration,
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Builds a broker from a `memory://<name>` connection string.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, QueueError> {
        match connection_string.strip_prefix(SCHEME) {
            Some(name) if !name.is_empty() => Ok(Self::new(name)),
            _ => Err(QueueError::InvalidConnectionString(
                connection_string.to_string(),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Opens a new connection owned by the caller.
    pub fn connect(&self) -> InMemoryConnection {
        self.shared.lock().open_connections += 1;
        debug!(broker = %self.shared.name, "Connection opened");
        InMemoryConnection {
            shared: self.shared.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// How many times `queue` was actually created.
    pub fn creations(&self, queue: &str) -> usize {
        self.shared.lock().creations.get(queue).copied().unwrap_or(0)
    }

    /// Messages waiting for delivery (not locked).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages currently locked by some receiver.
    pub fn locked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.locked.len())
    }

    /// Snapshot of the ready messages in delivery order.
    pub fn peek(&self, queue: &str) -> Vec<Envelope> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().open_connections
    }

    pub fn open_senders(&self) -> usize {
        self.shared.lock().open_senders
    }

    pub fn open_receivers(&self) -> usize {
        self.shared.lock().open_receivers
    }
}

/// One owner's connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        if self.shared.lock().queues.contains_key(queue) {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(queue.to_string()))
        }
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.lock().open_connections -= 1;
        }
    }
}

#[async_trait]
impl QueueAdmin for InMemoryConnection {
    async fn queue_exists(&self, queue: &str) -> Result<bool, QueueError> {
        self.ensure_open()?;
        Ok(self.shared.lock().queues.contains_key(queue))
    }

    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if state.queues.contains_key(queue) {
            return Err(QueueError::AlreadyExists(queue.to_string()));
        }
        state.queues.insert(queue.to_string(), QueueState::default());
        *state.creations.entry(queue.to_string()).or_default() += 1;
        debug!(broker = %self.shared.name, queue, "Queue created");
        Ok(())
    }
}

#[async_trait]
impl QueueClient for InMemoryConnection {
    async fn sender(&self, queue: &str) -> Result<Box<dyn QueueSender>, QueueError> {
        self.ensure_open()?;
        self.ensure_queue(queue)?;
        self.shared.lock().open_senders += 1;
        Ok(Box::new(InMemorySender {
            shared: self.shared.clone(),
            connection: self.closed.clone(),
            queue: queue.to_string(),
            closed: false,
        }))
    }

    async fn receiver(&self, queue: &str) -> Result<Box<dyn QueueReceiver>, QueueError> {
        self.ensure_open()?;
        self.ensure_queue(queue)?;
        self.shared.lock().open_receivers += 1;
        Ok(Box::new(InMemoryReceiver {
            shared: self.shared.clone(),
            connection: self.closed.clone(),
            queue: queue.to_string(),
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.lock().open_connections -= 1;
            debug!(broker = %self.shared.name, "Connection closed");
        }
        Ok(())
    }
}

struct InMemorySender {
    shared: Arc<Shared>,
    connection: Arc<AtomicBool>,
    queue: String,
    closed: bool,
}

impl Drop for InMemorySender {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.lock().open_senders -= 1;
        }
    }
}

#[async_trait]
impl QueueSender for InMemorySender {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn send(&self, envelope: Envelope) -> Result<(), QueueError> {
        if self.closed || self.connection.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed);
        }
        {
            let mut state = self.shared.lock();
            let queue = state
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| QueueError::QueueNotFound(self.queue.clone()))?;
            trace!(queue = %self.queue, message_id = %envelope.message_id, "Enqueued");
            queue.ready.push_back(StoredMessage {
                envelope,
                delivery_count: 0,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        if !self.closed {
            self.closed = true;
            self.shared.lock().open_senders -= 1;
        }
        Ok(())
    }
}

struct InMemoryReceiver {
    shared: Arc<Shared>,
    connection: Arc<AtomicBool>,
    queue: String,
    closed: bool,
}

impl InMemoryReceiver {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed || self.connection.load(Ordering::SeqCst) {
            Err(QueueError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn take_next(&self) -> Result<Taken, QueueError> {
        let now = Instant::now();
        let mut state = self.shared.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| QueueError::QueueNotFound(self.queue.clone()))?;
        queue.reclaim_expired(now);

        let Some(mut stored) = queue.ready.pop_front() else {
            return Ok(Taken::Empty {
                next_expiry: queue.next_expiry(),
            });
        };
        stored.delivery_count += 1;
        let lock_token = LockToken::new();
        let locked_until = now + self.shared.lock_duration;
        let received = ReceivedMessage {
            envelope: stored.envelope.clone(),
            lock_token,
            delivery_count: stored.delivery_count,
            locked_until,
        };
        queue.locked.insert(
            lock_token,
            LockedMessage {
                stored,
                locked_until,
            },
        );
        Ok(Taken::Message(received))
    }

    fn lock_lost(message: &ReceivedMessage) -> QueueError {
        QueueError::LockLost {
            message_id: message.envelope.message_id.clone(),
        }
    }
}

impl Drop for InMemoryReceiver {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.lock().open_receivers -= 1;
        }
    }
}

#[async_trait]
impl QueueReceiver for InMemoryReceiver {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            self.ensure_open()?;
            // Registered before the check so a send in between still wakes us.
            let notified = self.shared.notify.notified();
            let next_expiry = match self.take_next()? {
                Taken::Message(message) => return Ok(Some(message)),
                Taken::Empty { next_expiry } => next_expiry,
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.shared.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| QueueError::QueueNotFound(self.queue.clone()))?;
        queue.reclaim_expired(now);
        match queue.locked.remove(&message.lock_token) {
            Some(_) => Ok(()),
            None => Err(Self::lock_lost(message)),
        }
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.ensure_open()?;
        {
            let now = Instant::now();
            let mut state = self.shared.lock();
            let queue = state
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| QueueError::QueueNotFound(self.queue.clone()))?;
            queue.reclaim_expired(now);
            let locked = queue
                .locked
                .remove(&message.lock_token)
                .ok_or_else(|| Self::lock_lost(message))?;
            queue.ready.push_front(locked.stored);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Instant, QueueError> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.shared.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| QueueError::QueueNotFound(self.queue.clone()))?;
        queue.reclaim_expired(now);
        let locked = queue
            .locked
            .get_mut(&message.lock_token)
            .ok_or_else(|| Self::lock_lost(message))?;
        locked.locked_until = now + self.shared.lock_duration;
        Ok(locked.locked_until)
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        if !self.closed {
            self.closed = true;
            self.shared.lock().open_receivers -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_queue(queue: &str) -> (InMemoryBroker, InMemoryConnection) {
        let broker = InMemoryBroker::with_lock_duration("test", Duration::from_secs(5));
        let connection = broker.connect();
        connection.create_queue(queue).await.unwrap();
        (broker, connection)
    }

    #[test]
    fn test_connection_string() {
        let broker = InMemoryBroker::from_connection_string("memory://bikes").unwrap();
        assert_eq!(broker.name(), "bikes");

        assert!(matches!(
            InMemoryBroker::from_connection_string("amqp://localhost"),
            Err(QueueError::InvalidConnectionString(_))
        ));
        assert!(InMemoryBroker::from_connection_string("memory://").is_err());
    }

    #[tokio::test]
    async fn test_create_queue_twice_reports_already_exists() {
        let (broker, connection) = broker_with_queue("q").await;

        let err = connection.create_queue("q").await.unwrap_err();
        assert_eq!(err, QueueError::AlreadyExists("q".into()));
        assert_eq!(broker.creations("q"), 1);
    }

    #[tokio::test]
    async fn test_send_and_receive_require_existing_queue() {
        let broker = InMemoryBroker::new("test");
        let connection = broker.connect();

        assert!(matches!(
            connection.sender("missing").await,
            Err(QueueError::QueueNotFound(_))
        ));
        assert!(matches!(
            connection.receiver("missing").await,
            Err(QueueError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_locks_until_complete() {
        let (broker, connection) = broker_with_queue("q").await;
        let sender = connection.sender("q").await.unwrap();
        let mut receiver = connection.receiver("q").await.unwrap();

        sender.send(Envelope::new("c1", "a")).await.unwrap();
        let message = receiver
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.delivery_count, 1);
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.locked_count("q"), 1);

        receiver.complete(&message).await.unwrap();
        assert_eq!(broker.locked_count("q"), 0);
        assert!(matches!(
            receiver.complete(&message).await,
            Err(QueueError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_abandon_redelivers_with_higher_count() {
        let (_broker, connection) = broker_with_queue("q").await;
        let sender = connection.sender("q").await.unwrap();
        let mut receiver = connection.receiver("q").await.unwrap();
        sender.send(Envelope::new("c1", "a")).await.unwrap();

        let first = receiver.receive(Duration::ZERO).await.unwrap().unwrap();
        receiver.abandon(&first).await.unwrap();
        let second = receiver.receive(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(first.envelope, second.envelope);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.lock_token, second.lock_token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_redelivered() {
        let (_broker, connection) = broker_with_queue("q").await;
        let sender = connection.sender("q").await.unwrap();
        let mut first_receiver = connection.receiver("q").await.unwrap();
        let mut second_receiver = connection.receiver("q").await.unwrap();
        sender.send(Envelope::new("c1", "a")).await.unwrap();

        let held = first_receiver.receive(Duration::ZERO).await.unwrap().unwrap();
        assert!(second_receiver.receive(Duration::ZERO).await.unwrap().is_none());

        // Waits past the 5s lock; the receiver wakes at the expiry on its own.
        let redelivered = second_receiver
            .receive(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.delivery_count, 2);
        assert!(matches!(
            first_receiver.complete(&held).await,
            Err(QueueError::LockLost { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_lock_keeps_ownership() {
        let (broker, connection) = broker_with_queue("q").await;
        let sender = connection.sender("q").await.unwrap();
        let mut receiver = connection.receiver("q").await.unwrap();
        sender.send(Envelope::new("c1", "a")).await.unwrap();

        let message = receiver.receive(Duration::ZERO).await.unwrap().unwrap();
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(3)).await;
            receiver.renew_lock(&message).await.unwrap();
        }
        assert_eq!(broker.locked_count("q"), 1);
        receiver.complete(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_receiver_wakes_on_send() {
        let (_broker, connection) = broker_with_queue("q").await;
        let sender = connection.sender("q").await.unwrap();
        let mut receiver = connection.receiver("q").await.unwrap();

        let waiter = tokio::spawn(async move { receiver.receive(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        sender.send(Envelope::new("c1", "late")).await.unwrap();

        let message = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(message.envelope.body_text(), "late");
    }

    #[tokio::test]
    async fn test_handles_are_counted_and_released() {
        let (broker, connection) = broker_with_queue("q").await;
        let mut sender = connection.sender("q").await.unwrap();
        let receiver = connection.receiver("q").await.unwrap();
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_senders(), 1);
        assert_eq!(broker.open_receivers(), 1);

        sender.close().await.unwrap();
        drop(receiver);
        connection.close().await.unwrap();
        assert_eq!(broker.open_senders(), 0);
        assert_eq!(broker.open_receivers(), 0);
        assert_eq!(broker.open_connections(), 0);

        assert_eq!(
            sender.send(Envelope::new("c", "x")).await,
            Err(QueueError::ConnectionClosed)
        );
        drop(connection);
        assert_eq!(broker.open_connections(), 0);
    }
}
