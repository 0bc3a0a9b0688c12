use crate::model::{is_known_model, is_known_part, MIN_PARTS};
use serde::{Deserialize, Serialize};
use stage_framework::Contract;
use std::fmt::Display;

/// An order to assemble one bike.
///
/// Created at intake and never modified afterwards. On the wire it is the
/// JSON object `{"Id", "Price", "Model", "Parts"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssembleOrder {
    pub id: String,
    pub price: i32,
    pub model: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Part {
    pub id: String,
    pub name: String,
    /// 8-character product code.
    pub code: String,
}

impl Contract for AssembleOrder {
    const TYPE_TAG: &'static str = "AssembleOrder";
}

/// Why an order cannot be assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderDefect {
    EmptyId,
    NonPositivePrice(i32),
    UnknownModel(String),
    TooFewParts(usize),
    UnknownPart(String),
    BadPartCode(String),
}

impl Display for OrderDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderDefect::EmptyId => write!(f, "order id is empty"),
            OrderDefect::NonPositivePrice(price) => write!(f, "price {} is not positive", price),
            OrderDefect::UnknownModel(model) => write!(f, "unknown model '{}'", model),
            OrderDefect::TooFewParts(count) => {
                write!(f, "{} parts, at least {} required", count, MIN_PARTS)
            }
            OrderDefect::UnknownPart(name) => write!(f, "unknown part '{}'", name),
            OrderDefect::BadPartCode(code) => write!(f, "part code '{}' is not 8 characters", code),
        }
    }
}

impl AssembleOrder {
    pub fn new(id: impl Into<String>, price: i32, model: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            id: id.into(),
            price,
            model: model.into(),
            parts,
        }
    }

    /// Checks the order against the data model: a non-empty id, a positive
    /// price, a catalog model and at least six catalog parts.
    pub fn validate(&self) -> Result<(), OrderDefect> {
        if self.id.is_empty() {
            return Err(OrderDefect::EmptyId);
        }
        if self.price <= 0 {
            return Err(OrderDefect::NonPositivePrice(self.price));
        }
        if !is_known_model(&self.model) {
            return Err(OrderDefect::UnknownModel(self.model.clone()));
        }
        if self.parts.len() < MIN_PARTS {
            return Err(OrderDefect::TooFewParts(self.parts.len()));
        }
        for part in &self.parts {
            if !is_known_part(&part.name) {
                return Err(OrderDefect::UnknownPart(part.name.clone()));
            }
            if part.code.chars().count() != 8 {
                return Err(OrderDefect::BadPartCode(part.code.clone()));
            }
        }
        Ok(())
    }
}

impl Part {
    pub fn new(id: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            code: code.into(),
        }
    }
}
