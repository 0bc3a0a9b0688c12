//! # Queue Provisioner
//!
//! Makes sure a queue exists before anything sends to it or receives from it.

use crate::broker::QueueAdmin;
use crate::error::{QueueError, StageError};
use tracing::{debug, info, instrument};

/// Checks whether `queue` exists and creates it if it does not.
///
/// Safe to call from any number of stages at once: when two callers both see
/// the queue missing, one create wins and the other gets
/// [`QueueError::AlreadyExists`], which counts as success here.
///
/// Any other broker error (authorization, quota, connectivity) comes back as
/// [`StageError::Provisioning`].
#[instrument(skip(admin))]
pub async fn ensure_queue<A>(admin: &A, queue: &str) -> Result<(), StageError>
where
    A: QueueAdmin + ?Sized,
{
    let provisioning = |source: QueueError| StageError::Provisioning {
        queue: queue.to_string(),
        source,
    };

    if admin.queue_exists(queue).await.map_err(provisioning)? {
        debug!("Queue already present");
        return Ok(());
    }

    match admin.create_queue(queue).await {
        Ok(()) => {
            info!("Queue created");
            Ok(())
        }
        Err(QueueError::AlreadyExists(_)) => {
            debug!("Queue created concurrently by another caller");
            Ok(())
        }
        Err(e) => Err(provisioning(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::mock::MockBroker;

    #[tokio::test]
    async fn test_ensure_queue_is_idempotent() {
        let broker = InMemoryBroker::new("test");
        let connection = broker.connect();

        for _ in 0..5 {
            ensure_queue(&connection, "orders").await.unwrap();
        }

        assert!(broker.has_queue("orders"));
        assert_eq!(broker.creations("orders"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ensure_queue_from_concurrent_callers() {
        let broker = InMemoryBroker::new("test");

        let mut handles = vec![];
        for _ in 0..16 {
            let connection = broker.connect();
            handles.push(tokio::spawn(async move {
                ensure_queue(&connection, "orders").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.creations("orders"), 1);
    }

    #[tokio::test]
    async fn test_lost_create_race_is_not_an_error() {
        let mock = MockBroker::new(InMemoryBroker::new("test"));
        let connection = mock.connect();
        connection.create_queue("orders").await.unwrap();

        // The existence check says "absent", as it would for the loser of a race.
        mock.expect_queue_exists("orders").return_ok(false);

        ensure_queue(&connection, "orders").await.unwrap();
        assert_eq!(mock.broker().creations("orders"), 1);
        mock.verify();
    }

    #[tokio::test]
    async fn test_rejected_create_is_a_provisioning_error() {
        let mock = MockBroker::new(InMemoryBroker::new("test"));
        mock.expect_create_queue("orders")
            .return_err(QueueError::Unauthorized("listen-only key".into()));
        let connection = mock.connect();

        let err = ensure_queue(&connection, "orders").await.unwrap_err();
        assert_eq!(err.kind(), "provisioning");
        assert!(matches!(
            err,
            StageError::Provisioning { ref queue, source: QueueError::Unauthorized(_) } if queue == "orders"
        ));
        assert!(!mock.broker().has_queue("orders"));
        mock.verify();
    }
}
