//! # Order Intake
//!
//! The entry point of the pipeline: turns a purchase into one `AssembleOrder`
//! message on the assembly queue and returns straight away. Whatever happens
//! downstream is only visible in the logs.
//!
//! ## Structure
//!
//! - [`OrderIntake`] - publishes orders
//! - [`generator`] - [`OrderGenerator`] for synthetic orders
//! - [`error`] - [`IntakeError`]

pub mod error;
pub mod generator;

pub use error::*;
pub use generator::OrderGenerator;

use crate::model::AssembleOrder;
use stage_framework::{ensure_queue, new_message_id, Envelope, QueueClient, QueueSender};
use tracing::{info, instrument};

/// Acknowledgment for a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub order_id: String,
    pub message_id: String,
    /// Follows the order through every stage.
    pub correlation_id: String,
}

/// Publishes orders to the assembly queue.
pub struct OrderIntake {
    connection: Box<dyn QueueClient>,
    sender: Box<dyn QueueSender>,
    generator: OrderGenerator,
}

impl OrderIntake {
    /// Provisions `queue` and opens a sender on it.
    pub async fn connect(
        connection: impl QueueClient + 'static,
        queue: &str,
        generator: OrderGenerator,
    ) -> Result<Self, IntakeError> {
        ensure_queue(&connection, queue).await?;
        let sender = connection.sender(queue).await?;
        Ok(Self {
            connection: Box::new(connection),
            sender,
            generator,
        })
    }

    pub fn queue(&self) -> &str {
        self.sender.queue()
    }

    /// Publishes `order` under a fresh message id and a fresh correlation id.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn submit(&self, order: &AssembleOrder) -> Result<Accepted, IntakeError> {
        let envelope = Envelope::for_contract(order, new_message_id())?;
        let accepted = Accepted {
            order_id: order.id.clone(),
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
        };

        info!("Sending buying request");
        self.sender.send(envelope).await?;
        info!(
            message_id = %accepted.message_id,
            correlation_id = %accepted.correlation_id,
            "Bike bought"
        );
        Ok(accepted)
    }

    /// Generates a random order and submits it.
    pub async fn submit_random(&mut self) -> Result<Accepted, IntakeError> {
        let order = self.generator.generate();
        self.submit(&order).await
    }

    /// Generates a random order for `model` and submits it.
    pub async fn submit_model(&mut self, model: &str) -> Result<Accepted, IntakeError> {
        let order = self.generator.generate_for_model(model);
        self.submit(&order).await
    }

    pub async fn close(mut self) -> Result<(), IntakeError> {
        self.sender.close().await?;
        self.connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Part;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use stage_framework::mock::MockBroker;
    use stage_framework::{InMemoryBroker, QueueError};

    fn generator() -> OrderGenerator {
        OrderGenerator::new(StdRng::seed_from_u64(1))
    }

    #[tokio::test]
    async fn test_submit_publishes_one_tagged_message() {
        let broker = InMemoryBroker::new("test");
        let intake = OrderIntake::connect(broker.connect(), "assemble", generator())
            .await
            .unwrap();

        let parts = (0..6).map(|i| Part::new(i.to_string(), "chain", "96385074")).collect();
        let order = AssembleOrder::new("abc123", 999, "urban", parts);
        let accepted = intake.submit(&order).await.unwrap();

        let queued = broker.peek("assemble");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message_id, accepted.message_id);
        assert_eq!(queued[0].correlation_id, accepted.correlation_id);
        assert_ne!(accepted.message_id, accepted.correlation_id);
        assert_eq!(queued[0].type_tag.as_deref(), Some("AssembleOrder"));
        assert_eq!(queued[0].decode::<AssembleOrder>().unwrap(), order);
    }

    #[tokio::test]
    async fn test_every_submission_gets_a_new_correlation_id() {
        let broker = InMemoryBroker::new("test");
        let mut intake = OrderIntake::connect(broker.connect(), "assemble", generator())
            .await
            .unwrap();

        let first = intake.submit_random().await.unwrap();
        let second = intake.submit_model("gravel").await.unwrap();

        assert_ne!(first.correlation_id, second.correlation_id);
        assert_eq!(broker.ready_count("assemble"), 2);
        intake.close().await.unwrap();
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_senders(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let mock = MockBroker::new(InMemoryBroker::new("test"));
        mock.expect_send("assemble")
            .return_err(QueueError::Transport("connection reset".into()));
        let mut intake = OrderIntake::connect(mock.connect(), "assemble", generator())
            .await
            .unwrap();

        let err = intake.submit_random().await.unwrap_err();
        assert!(matches!(err, IntakeError::Publish(QueueError::Transport(_))));
        mock.verify();
    }
}
