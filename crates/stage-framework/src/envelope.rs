//! # Message Envelope
//!
//! The wire contract shared by every stage. A payload travels inside an
//! [`Envelope`] that carries the broker-level identity (`message_id`), the
//! order-level trace identity (`correlation_id`) and an advisory `type_tag`.
//!
//! Payload schemas implement [`Contract`]. Receivers decode with
//! [`Envelope::decode`] and never consult the type tag first.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{self, Debug, Display};
use tokio::time::Instant;
use uuid::Uuid;

/// A JSON payload schema that can travel inside an [`Envelope`].
pub trait Contract: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Written into [`Envelope::type_tag`] on send.
    const TYPE_TAG: &'static str;
}

/// Outbound type for terminal stages. It has no values, so a terminal
/// handler can only ever return `Ok(None)`.
#[derive(Debug, Serialize, Deserialize)]
pub enum NoForward {}

impl Contract for NoForward {
    const TYPE_TAG: &'static str = "NoForward";
}

/// A message as it sits on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub correlation_id: String,
    pub body: Vec<u8>,
    pub type_tag: Option<String>,
}

impl Envelope {
    /// Wraps a raw body with a fresh message id.
    pub fn new(correlation_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: new_message_id(),
            correlation_id: correlation_id.into(),
            body: body.into(),
            type_tag: None,
        }
    }

    /// Serializes `payload` as UTF-8 JSON and tags it with the contract name.
    pub fn for_contract<T: Contract>(
        payload: &T,
        correlation_id: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(correlation_id, body).with_type_tag(T::TYPE_TAG))
    }

    pub fn with_type_tag(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = Some(tag.into());
        self
    }

    pub fn decode<T: Contract>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body as text for logging; invalid UTF-8 is replaced, not rejected.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Fresh identifier for message and correlation ids.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identifies one delivery of a message to one receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock_{}", self.0)
    }
}

/// A message delivered under peek-lock. It stays on the queue until it is
/// completed; if the lock runs out first, the broker redelivers it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    pub lock_token: LockToken,
    /// Starts at 1 and grows on every redelivery.
    pub delivery_count: u32,
    pub locked_until: Instant,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.envelope.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Ping {
        id: String,
    }

    impl Contract for Ping {
        const TYPE_TAG: &'static str = "Ping";
    }

    #[test]
    fn test_for_contract_sets_tag_and_fresh_id() {
        let a = Envelope::for_contract(&Ping { id: "1".into() }, "corr").unwrap();
        let b = Envelope::for_contract(&Ping { id: "1".into() }, "corr").unwrap();

        assert_eq!(a.type_tag.as_deref(), Some("Ping"));
        assert_eq!(a.correlation_id, "corr");
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.body_text(), r#"{"Id":"1"}"#);
    }

    #[test]
    fn test_decode_ignores_type_tag() {
        let envelope = Envelope::new("corr", r#"{"Id":"7"}"#).with_type_tag("SomethingElse");
        let ping: Ping = envelope.decode().unwrap();
        assert_eq!(ping, Ping { id: "7".into() });
    }

    #[test]
    fn test_decode_rejects_malformed_body() {
        let envelope = Envelope::new("corr", "not json");
        assert!(envelope.decode::<Ping>().is_err());
        assert!(envelope.decode::<NoForward>().is_err());
    }
}
