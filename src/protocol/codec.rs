//! JSON encoding, decoding and structural validation of [`Message`]s.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::message::{Message, MessageType};
use crate::utils::ProtocolError;

/// Outcome of [`validate`]: `valid` is true exactly when `errors` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    /// Converts a failed validation into `ProtocolError::Validation`.
    pub fn into_result(self) -> Result<(), ProtocolError> {
        if self.valid {
            Ok(())
        } else {
            Err(ProtocolError::Validation(self.errors))
        }
    }
}

pub fn serialize(message: &Message) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Parses an inbound frame.
///
/// The envelope must be a JSON object carrying a known `type`; an invalid
/// `priority` or `channel` is rejected here as well.
pub fn deserialize(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

    let Some(envelope) = value.as_object() else {
        return Err(ProtocolError::Deserialization(
            "envelope must be a JSON object".to_string(),
        ));
    };

    match envelope.get("type") {
        None | Some(Value::Null) => {
            return Err(ProtocolError::Deserialization(
                "missing 'type' field".to_string(),
            ));
        }
        Some(Value::String(kind)) => {
            kind.parse::<MessageType>()
                .map_err(ProtocolError::Deserialization)?;
        }
        Some(_) => {
            return Err(ProtocolError::Deserialization(
                "'type' must be a string".to_string(),
            ));
        }
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Structural check of a decoded message.
pub fn validate(message: &Message) -> Validation {
    let mut errors = Vec::new();

    if message.timestamp <= 0 {
        errors.push("timestamp is required".to_string());
    }
    if !message.data.is_object() {
        errors.push("data must be an object".to_string());
    }
    // priority is range-checked by `deserialize`

    match message.kind {
        MessageType::Request => {
            if message.data_str("requestType").is_none() {
                errors.push("request requires a string data.requestType".to_string());
            }
            if let Some(params) = message.data.get("params") {
                if !params.is_object() && !params.is_null() {
                    errors.push("request data.params must be an object".to_string());
                }
            }
        }
        MessageType::Subscribe | MessageType::Unsubscribe => {
            let channels = message.data.get("channels").and_then(Value::as_array);
            match channels {
                Some(list) if !list.is_empty() => {
                    if list.iter().any(|c| !c.is_string()) {
                        errors.push("data.channels must contain strings".to_string());
                    }
                }
                _ => errors.push(format!("{} requires a non-empty data.channels", message.kind)),
            }
        }
        _ => {}
    }

    Validation {
        valid: errors.is_empty(),
        errors,
    }
}

/// `deserialize` followed by `validate`.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let message = deserialize(bytes)?;
    validate(&message).into_result()?;
    Ok(message)
}
