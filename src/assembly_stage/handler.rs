use super::address::AddressGenerator;
use super::error::AssemblyError;
use crate::model::{AssembleOrder, ShipOrder};
use async_trait::async_trait;
use stage_framework::{MessageContext, StageHandler};
use std::time::Duration;
use tracing::{debug, info};

/// Builds the bike described by an [`AssembleOrder`] and asks for it to be shipped.
#[derive(Debug)]
pub struct AssemblyHandler {
    work_duration: Duration,
    addresses: AddressGenerator,
}

impl AssemblyHandler {
    pub fn new(work_duration: Duration, addresses: AddressGenerator) -> Self {
        Self {
            work_duration,
            addresses,
        }
    }
}

#[async_trait]
impl StageHandler for AssemblyHandler {
    type Inbound = AssembleOrder;
    type Outbound = ShipOrder;
    type Error = AssemblyError;

    async fn handle(
        &mut self,
        order: AssembleOrder,
        ctx: &MessageContext,
    ) -> Result<Option<ShipOrder>, AssemblyError> {
        debug!(?order, "Assemble order received");
        order
            .validate()
            .map_err(|defect| AssemblyError::InvalidOrder {
                order_id: order.id.clone(),
                defect,
            })?;

        info!(
            order_id = %order.id,
            model = %order.model,
            parts = order.parts.len(),
            delivery_count = ctx.delivery_count,
            "Assembling bike"
        );
        ctx.sleep(self.work_duration).await?;

        let address = self.addresses.next_address();
        info!(order_id = %order.id, address = %address, "Bike assembled");
        Ok(Some(ShipOrder::new(order.id, address)))
    }
}
