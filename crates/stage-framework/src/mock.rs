//! # Mock Broker
//!
//! Failure injection for tests. [`MockBroker`] wraps a real [`InMemoryBroker`]
//! and lets a test script what individual broker calls return. Any call with no
//! matching expectation goes straight through to the in-memory broker, so a
//! test only describes the failures it cares about.
//!
//! ```rust
//! use stage_framework::mock::MockBroker;
//! use stage_framework::{InMemoryBroker, QueueError};
//!
//! let mock = MockBroker::new(InMemoryBroker::new("test"));
//! mock.expect_create_queue("orders")
//!     .return_err(QueueError::QuotaExceeded("namespace full".into()));
//! mock.expect_receive("orders")
//!     .return_err(QueueError::Transport("connection reset".into()));
//!
//! let connection = mock.connect();
//! // ... hand `connection` to the code under test ...
//! # drop(connection);
//! ```
//!
//! Expectations are consumed in order, one per matching call. Call
//! [`MockBroker::verify`] at the end of the test to check all were used.

use crate::broker::{QueueAdmin, QueueClient, QueueReceiver, QueueSender};
use crate::envelope::{Envelope, ReceivedMessage};
use crate::error::{QueueError, StageError};
use crate::handler::{ErrorContext, ErrorHandler};
use crate::memory::{InMemoryBroker, InMemoryConnection};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    QueueExists,
    CreateQueue,
    Send,
    Receive,
    Complete,
}

#[derive(Debug)]
enum Response {
    Exists(Result<bool, QueueError>),
    Unit(Result<(), QueueError>),
}

#[derive(Debug)]
struct Expectation {
    operation: Operation,
    queue: String,
    response: Response,
}

type Expectations = Arc<Mutex<VecDeque<Expectation>>>;

fn take(expectations: &Expectations, operation: Operation, queue: &str) -> Option<Response> {
    let mut exps = expectations.lock().unwrap();
    let position = exps
        .iter()
        .position(|e| e.operation == operation && e.queue == queue)?;
    exps.remove(position).map(|e| e.response)
}

/// A broker whose calls can be scripted to fail.
#[derive(Clone)]
pub struct MockBroker {
    broker: InMemoryBroker,
    expectations: Expectations,
}

impl MockBroker {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            expectations: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// The wrapped broker, for inspecting queue state.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn connect(&self) -> MockConnection {
        MockConnection {
            inner: self.broker.connect(),
            expectations: self.expectations.clone(),
        }
    }

    /// Expects a `queue_exists` check.
    pub fn expect_queue_exists(&self, queue: &str) -> ExistsExpectationBuilder {
        ExistsExpectationBuilder {
            queue: queue.to_string(),
            expectations: self.expectations.clone(),
        }
    }

    /// Expects a `create_queue` call. `return_ok` pretends the queue was created.
    pub fn expect_create_queue(&self, queue: &str) -> ExpectationBuilder {
        self.builder(Operation::CreateQueue, queue)
    }

    /// Expects a `send` on a sender for `queue`. `return_ok` silently drops the message.
    pub fn expect_send(&self, queue: &str) -> ExpectationBuilder {
        self.builder(Operation::Send, queue)
    }

    /// Expects a `receive` on `queue`. `return_ok` reports an empty wait.
    pub fn expect_receive(&self, queue: &str) -> ExpectationBuilder {
        self.builder(Operation::Receive, queue)
    }

    /// Expects a `complete` on `queue`. `return_ok` leaves the message locked.
    pub fn expect_complete(&self, queue: &str) -> ExpectationBuilder {
        self.builder(Operation::Complete, queue)
    }

    fn builder(&self, operation: Operation, queue: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            operation,
            queue: queue.to_string(),
            expectations: self.expectations.clone(),
        }
    }

    /// Expectations not yet consumed.
    pub fn remaining(&self) -> usize {
        self.expectations.lock().unwrap().len()
    }

    /// Verifies that all expectations were met.
    pub fn verify(&self) {
        let exps = self.expectations.lock().unwrap();
        if !exps.is_empty() {
            panic!(
                "Not all expectations were met. {} remaining: {:?}",
                exps.len(),
                exps
            );
        }
    }
}

/// Builder for `queue_exists` expectations.
pub struct ExistsExpectationBuilder {
    queue: String,
    expectations: Expectations,
}

impl ExistsExpectationBuilder {
    pub fn return_ok(self, exists: bool) {
        self.push(Ok(exists));
    }

    pub fn return_err(self, error: QueueError) {
        self.push(Err(error));
    }

    fn push(self, response: Result<bool, QueueError>) {
        self.expectations.lock().unwrap().push_back(Expectation {
            operation: Operation::QueueExists,
            queue: self.queue,
            response: Response::Exists(response),
        });
    }
}

/// Builder for expectations on calls that return no value.
pub struct ExpectationBuilder {
    operation: Operation,
    queue: String,
    expectations: Expectations,
}

impl ExpectationBuilder {
    pub fn return_ok(self) {
        self.push(Ok(()));
    }

    pub fn return_err(self, error: QueueError) {
        self.push(Err(error));
    }

    /// Shorthand for scripting the same failure `times` times in a row.
    pub fn return_err_times(self, error: QueueError, times: usize) {
        let mut exps = self.expectations.lock().unwrap();
        for _ in 0..times {
            exps.push_back(Expectation {
                operation: self.operation,
                queue: self.queue.clone(),
                response: Response::Unit(Err(error.clone())),
            });
        }
    }

    fn push(self, response: Result<(), QueueError>) {
        self.expectations.lock().unwrap().push_back(Expectation {
            operation: self.operation,
            queue: self.queue,
            response: Response::Unit(response),
        });
    }
}

fn unit(response: Response) -> Result<(), QueueError> {
    match response {
        Response::Unit(result) => result,
        Response::Exists(result) => result.map(|_| ()),
    }
}

/// Connection handed out by [`MockBroker::connect`].
pub struct MockConnection {
    inner: InMemoryConnection,
    expectations: Expectations,
}

#[async_trait]
impl QueueAdmin for MockConnection {
    async fn queue_exists(&self, queue: &str) -> Result<bool, QueueError> {
        match take(&self.expectations, Operation::QueueExists, queue) {
            Some(Response::Exists(result)) => result,
            Some(other) => unit(other).map(|_| false),
            None => self.inner.queue_exists(queue).await,
        }
    }

    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        match take(&self.expectations, Operation::CreateQueue, queue) {
            Some(response) => unit(response),
            None => self.inner.create_queue(queue).await,
        }
    }
}

#[async_trait]
impl QueueClient for MockConnection {
    async fn sender(&self, queue: &str) -> Result<Box<dyn QueueSender>, QueueError> {
        let inner = self.inner.sender(queue).await?;
        Ok(Box::new(MockSender {
            inner,
            expectations: self.expectations.clone(),
        }))
    }

    async fn receiver(&self, queue: &str) -> Result<Box<dyn QueueReceiver>, QueueError> {
        let inner = self.inner.receiver(queue).await?;
        Ok(Box::new(MockReceiver {
            inner,
            expectations: self.expectations.clone(),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

struct MockSender {
    inner: Box<dyn QueueSender>,
    expectations: Expectations,
}

#[async_trait]
impl QueueSender for MockSender {
    fn queue(&self) -> &str {
        self.inner.queue()
    }

    async fn send(&self, envelope: Envelope) -> Result<(), QueueError> {
        match take(&self.expectations, Operation::Send, self.inner.queue()) {
            Some(response) => unit(response),
            None => self.inner.send(envelope).await,
        }
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

struct MockReceiver {
    inner: Box<dyn QueueReceiver>,
    expectations: Expectations,
}

#[async_trait]
impl QueueReceiver for MockReceiver {
    fn queue(&self) -> &str {
        self.inner.queue()
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        match take(&self.expectations, Operation::Receive, self.inner.queue()) {
            Some(response) => unit(response).map(|_| None),
            None => self.inner.receive(max_wait).await,
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        match take(&self.expectations, Operation::Complete, self.inner.queue()) {
            Some(response) => unit(response),
            None => self.inner.complete(message).await,
        }
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.inner.abandon(message).await
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Instant, QueueError> {
        self.inner.renew_lock(message).await
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

/// One error as seen by [`RecordingErrorHandler`].
#[derive(Debug, Clone)]
pub struct RecordedError {
    pub kind: &'static str,
    pub message: String,
    pub stage: String,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// [`ErrorHandler`] that keeps everything it is given, for assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingErrorHandler {
    errors: Arc<Mutex<Vec<RecordedError>>>,
}

impl RecordingErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors.lock().unwrap().clone()
    }

    /// Error kinds in the order they were reported.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.errors.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn on_error(&self, error: &StageError, ctx: &ErrorContext<'_>) {
        self.errors.lock().unwrap().push(RecordedError {
            kind: error.kind(),
            message: error.to_string(),
            stage: ctx.stage.to_string(),
            message_id: ctx.message_id.map(str::to_string),
            correlation_id: ctx.correlation_id.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_error_handler_keeps_context() {
        let recorder = RecordingErrorHandler::new();
        let ctx = ErrorContext {
            stage: "assembly",
            queue: "in",
            message_id: Some("m1"),
            correlation_id: None,
        };
        recorder.on_error(&StageError::Serialization("bad".into()), &ctx);

        let errors = recorder.errors();
        assert_eq!(recorder.kinds(), vec!["serialization"]);
        assert_eq!(errors[0].stage, "assembly");
        assert_eq!(errors[0].message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_unscripted_calls_pass_through() {
        let mock = MockBroker::new(InMemoryBroker::new("test"));
        let connection = mock.connect();

        connection.create_queue("q").await.unwrap();
        assert!(connection.queue_exists("q").await.unwrap());
        assert!(mock.broker().has_queue("q"));
        mock.verify();
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let mock = MockBroker::new(InMemoryBroker::new("test"));
        let connection = mock.connect();
        connection.create_queue("q").await.unwrap();
        mock.expect_send("q")
            .return_err_times(QueueError::Transport("reset".into()), 2);

        let sender = connection.sender("q").await.unwrap();
        assert!(sender.send(Envelope::new("c", "1")).await.is_err());
        assert!(sender.send(Envelope::new("c", "2")).await.is_err());
        assert_eq!(mock.remaining(), 0);
        sender.send(Envelope::new("c", "3")).await.unwrap();

        assert_eq!(mock.broker().ready_count("q"), 1);
        mock.verify();
    }

    #[test]
    #[should_panic(expected = "Not all expectations were met")]
    fn test_verify_panics_on_unused_expectation() {
        let mock = MockBroker::new(InMemoryBroker::new("test"));
        mock.expect_receive("q").return_ok();
        mock.verify();
    }
}
