use serde::{Deserialize, Serialize};
use stage_framework::Contract;

/// Request to ship an assembled bike. `id` is always the originating order's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShipOrder {
    pub id: String,
    pub address: String,
}

impl Contract for ShipOrder {
    const TYPE_TAG: &'static str = "ShipOrder";
}

impl ShipOrder {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}
