use serde::{Deserialize, Serialize};
use serde_json::Value;

use busgate_proto::{PublishRequest, RecordFrame};

use crate::message::DistributedMessage;
use crate::{BusError, Result};

/// Event name carried by records that wrap a [`DistributedMessage`].
pub const MESSAGE_EVENT: &str = "message";

/// A queue entry: `value` is addressed to `path` and tagged with `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub path: String,
    pub event: String,
    pub value: Value,
    #[serde(default)]
    pub published_at_ms: i64,
}

impl QueueRecord {
    /// Wrap a message for the queue, addressed to its target.
    pub fn from_message(message: &DistributedMessage) -> Result<Self> {
        Ok(Self {
            path: message.target().to_string(),
            event: MESSAGE_EVENT.to_string(),
            value: serde_json::to_value(message)?,
            published_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Decode the wrapped message. Records with another event name or a
    /// value that is not a valid message are rejected.
    pub fn into_message(self) -> Result<DistributedMessage> {
        if self.event != MESSAGE_EVENT {
            return Err(BusError::InvalidMessage(format!(
                "unexpected event '{}' on path {}",
                self.event, self.path
            )));
        }
        serde_json::from_value(self.value).map_err(|e| BusError::InvalidMessage(e.to_string()))
    }

    pub fn to_publish_request(&self) -> Result<PublishRequest> {
        Ok(PublishRequest {
            path: self.path.clone(),
            event: self.event.clone(),
            value: serde_json::to_vec(&self.value)?,
        })
    }

    pub fn from_publish_request(request: PublishRequest) -> Result<Self> {
        Ok(Self {
            path: request.path,
            event: request.event,
            value: decode_value(&request.value)?,
            published_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn to_frame(&self, delivery_id: u64) -> Result<RecordFrame> {
        Ok(RecordFrame {
            delivery_id,
            path: self.path.clone(),
            event: self.event.clone(),
            value: serde_json::to_vec(&self.value)?,
            published_at_ms: self.published_at_ms,
        })
    }

    pub fn from_frame(frame: RecordFrame) -> Result<Self> {
        Ok(Self {
            path: frame.path,
            event: frame.event,
            value: decode_value(&frame.value)?,
            published_at_ms: frame.published_at_ms,
        })
    }
}

fn decode_value(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| BusError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wraps_message_at_its_target() {
        let msg = DistributedMessage::new("a", "b", "queue", json!({"k": 1})).unwrap();
        let record = QueueRecord::from_message(&msg).unwrap();
        assert_eq!(record.path, "b");
        assert_eq!(record.event, MESSAGE_EVENT);
        assert_eq!(record.into_message().unwrap(), msg);
    }

    #[test]
    fn rejects_foreign_events() {
        let record = QueueRecord {
            path: "b".into(),
            event: "put".into(),
            value: json!({"sender": "a", "target": "b"}),
            published_at_ms: 0,
        };
        assert!(matches!(
            record.into_message(),
            Err(BusError::InvalidMessage(_))
        ));
    }

    #[test]
    fn rejects_ill_typed_values() {
        let record = QueueRecord {
            path: "b".into(),
            event: MESSAGE_EVENT.into(),
            value: json!({"sender": 5}),
            published_at_ms: 0,
        };
        assert!(record.into_message().is_err());
    }

    #[test]
    fn frame_with_garbage_value_is_invalid() {
        let frame = RecordFrame {
            delivery_id: 1,
            path: "b".into(),
            event: MESSAGE_EVENT.into(),
            value: b"{not json".to_vec(),
            published_at_ms: 0,
        };
        assert!(QueueRecord::from_frame(frame).is_err());
    }
}
