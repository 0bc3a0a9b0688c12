use super::error::ShippingError;
use crate::model::ShipOrder;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use stage_framework::{MessageContext, NoForward, StageHandler};
use std::time::Duration;
use tracing::info;

/// Ships an assembled bike. Last stage of the pipeline: nothing is forwarded.
#[derive(Debug)]
pub struct ShippingHandler {
    min_work: Duration,
    max_work: Duration,
    rng: StdRng,
}

impl ShippingHandler {
    /// Each shipment takes a random time in `[min_work, max_work)`.
    pub fn new(min_work: Duration, max_work: Duration, rng: StdRng) -> Self {
        Self {
            min_work,
            max_work,
            rng,
        }
    }

    fn work_duration(&mut self) -> Duration {
        if self.min_work >= self.max_work {
            return self.min_work;
        }
        self.rng.gen_range(self.min_work..self.max_work)
    }
}

#[async_trait]
impl StageHandler for ShippingHandler {
    type Inbound = ShipOrder;
    type Outbound = NoForward;
    type Error = ShippingError;

    async fn handle(
        &mut self,
        shipment: ShipOrder,
        ctx: &MessageContext,
    ) -> Result<Option<NoForward>, ShippingError> {
        if shipment.address.trim().is_empty() {
            return Err(ShippingError::MissingAddress {
                order_id: shipment.id,
            });
        }

        let work = self.work_duration();
        ctx.sleep(work).await?;

        info!(
            order_id = %shipment.id,
            address = %shipment.address,
            correlation_id = %ctx.correlation_id,
            "Bike shipped"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tokio_util::sync::CancellationToken;

    fn handler() -> ShippingHandler {
        ShippingHandler::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            StdRng::seed_from_u64(9),
        )
    }

    #[test]
    fn test_work_duration_stays_in_range() {
        let mut handler = handler();
        for _ in 0..100 {
            let work = handler.work_duration();
            assert!(work >= Duration::from_secs(1) && work < Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shipping_is_terminal() {
        let ctx = MessageContext::new("m1", "c1", 1, CancellationToken::new());
        let started = tokio::time::Instant::now();

        let out = handler()
            .handle(ShipOrder::new("abc123", "1 Via Roma, 20121 Milano"), &ctx)
            .await
            .unwrap();

        assert!(out.is_none());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_address_is_rejected() {
        let ctx = MessageContext::new("m1", "c1", 1, CancellationToken::new());
        let err = handler()
            .handle(ShipOrder::new("abc123", " "), &ctx)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ShippingError::MissingAddress {
                order_id: "abc123".into()
            }
        );
    }
}
