//! The envelope exchanged between gateways.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BusError, Result};

/// Name of a local or remote endpoint (e.g. `"node-1"`, `"worker.images"`).
pub type RecipientId = String;

/// Identifier of the adapter that carried (or should carry) a message.
pub type TransportId = String;

/// Immutable message envelope routed by a [`BusGateway`](crate::BusGateway).
///
/// `sender` and `target` are guaranteed non-empty: both the constructor and
/// deserialization reject empty names, so every value of this type is
/// routable. Fields are only exposed through getters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct DistributedMessage {
    sender: RecipientId,
    target: RecipientId,
    transporter: TransportId,
    payload: Value,
}

/// Unvalidated wire shape, checked on the way into [`DistributedMessage`].
#[derive(Deserialize)]
struct RawMessage {
    sender: String,
    target: String,
    #[serde(default)]
    transporter: String,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<RawMessage> for DistributedMessage {
    type Error = BusError;

    fn try_from(raw: RawMessage) -> Result<Self> {
        DistributedMessage::new(raw.sender, raw.target, raw.transporter, raw.payload)
    }
}

impl DistributedMessage {
    pub fn new(
        sender: impl Into<RecipientId>,
        target: impl Into<RecipientId>,
        transporter: impl Into<TransportId>,
        payload: impl Into<Value>,
    ) -> Result<Self> {
        let sender = sender.into();
        let target = target.into();
        if sender.is_empty() {
            return Err(BusError::InvalidMessage("sender is empty".into()));
        }
        if target.is_empty() {
            return Err(BusError::InvalidMessage("target is empty".into()));
        }
        Ok(Self {
            sender,
            target,
            transporter: transporter.into(),
            payload: payload.into(),
        })
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn transporter(&self) -> &str {
        &self.transporter
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// True when the message is addressed to its own sender and never needs
    /// to leave the process.
    pub fn is_loopback(&self) -> bool {
        self.sender == self.target
    }

    /// JSON wire encoding used by every transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BusError::InvalidMessage(e.to_string()))
    }
}
