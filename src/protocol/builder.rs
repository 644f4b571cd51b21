use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::message::{Channel, Message, MessageType, Priority};
use crate::utils::ProtocolError;

/// Fluent accumulator for ad hoc messages.
///
/// ```
/// use dashsync::protocol::{MessageBuilder, MessageType, Priority};
///
/// let msg = MessageBuilder::new()
///     .kind(MessageType::StatusUpdate)
///     .data(&serde_json::json!({ "component": "server" }))
///     .priority(Priority::High)
///     .build()
///     .unwrap();
/// assert_eq!(msg.kind, MessageType::StatusUpdate);
/// ```
#[derive(Debug, Default)]
pub struct MessageBuilder {
    kind: Option<MessageType>,
    data: Option<Result<Value, String>>,
    channel: Option<Channel>,
    priority: Option<Priority>,
    correlation_id: Option<String>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Payload; encoding errors are reported by [`build`](Self::build).
    pub fn data<T: Serialize + ?Sized>(mut self, data: &T) -> Self {
        self.data = Some(serde_json::to_value(data).map_err(|e| e.to_string()));
        self
    }

    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn build(self) -> Result<Message, ProtocolError> {
        let kind = self.kind.ok_or(ProtocolError::MissingType)?;
        let data = match self.data {
            Some(Ok(value)) => value,
            Some(Err(e)) => return Err(ProtocolError::Serialization(e)),
            None => Value::Object(Map::new()),
        };

        let mut message = Message::new(kind, data);
        if let Some(channel) = self.channel {
            message.channel = Some(channel);
        }
        if let Some(priority) = self.priority {
            message.priority = priority;
        }
        message.correlation_id = self.correlation_id;
        Ok(message)
    }
}
