//! Typed constructors, one per message kind.
//!
//! Each constructor fixes the shape of `data` for its kind and assigns the
//! implied channel and a default priority.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::protocol::message::{Channel, Message, MessageType, Priority};

/// Machine-readable `data.code` of `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Inbound bytes could not be parsed or failed validation.
    InvalidMessage,
    /// The client sent a kind only the server may send.
    UnsupportedMessage,
    UnknownRequest,
    InvalidParams,
    RequestFailed,
}

pub fn connection_ack(client_id: u64, server_version: &str) -> Message {
    Message::new(
        MessageType::Connection,
        json!({
            "clientId": client_id,
            "serverVersion": server_version,
            "protocolVersion": crate::protocol::PROTOCOL_VERSION,
            "channels": [
                Channel::Config,
                Channel::Logs,
                Channel::Metrics,
                Channel::Status,
                Channel::All,
            ],
        }),
    )
}

pub fn subscribe(channels: &[Channel]) -> Message {
    Message::new(MessageType::Subscribe, json!({ "channels": channels }))
}

pub fn unsubscribe(channels: &[Channel]) -> Message {
    Message::new(MessageType::Unsubscribe, json!({ "channels": channels }))
}

pub fn request(request_type: &str, params: Value) -> Message {
    Message::new(
        MessageType::Request,
        json!({ "requestType": request_type, "params": params }),
    )
}

/// Answer to the request whose id is `correlation_id`.
pub fn response(correlation_id: &str, result: Value) -> Message {
    Message::new(MessageType::Response, json!({ "result": result }))
        .with_correlation_id(correlation_id)
}

pub fn error(code: ErrorCode, message: &str, correlation_id: Option<&str>) -> Message {
    let msg = Message::new(
        MessageType::Error,
        json!({ "code": code, "message": message }),
    )
    .with_priority(Priority::High);

    match correlation_id {
        Some(id) => msg.with_correlation_id(id),
        None => msg,
    }
}

pub fn config_change(path: &str, config: Value) -> Message {
    Message::new(
        MessageType::ConfigChange,
        json!({ "path": path, "config": config }),
    )
    .with_priority(Priority::High)
}

pub fn log_change(path: &str, filename: &str, recent_content: &str, line_count: usize) -> Message {
    Message::new(
        MessageType::LogChange,
        json!({
            "path": path,
            "filename": filename,
            "recentContent": recent_content,
            "lineCount": line_count,
        }),
    )
}

pub fn log_added(path: &str, filename: &str) -> Message {
    Message::new(
        MessageType::LogAdded,
        json!({ "path": path, "filename": filename }),
    )
}

pub fn log_removed(path: &str, filename: &str) -> Message {
    Message::new(
        MessageType::LogRemoved,
        json!({ "path": path, "filename": filename }),
    )
}

pub fn project_config_change(path: &str, project: Option<&str>, config: Value) -> Message {
    Message::new(
        MessageType::ProjectConfigChange,
        json!({ "path": path, "project": project, "config": config }),
    )
    .with_priority(Priority::High)
}

/// `component` names what the status describes, e.g. `server` or `watcher`.
pub fn status_update(component: &str, status: Value) -> Message {
    Message::new(
        MessageType::StatusUpdate,
        json!({ "component": component, "status": status }),
    )
}

pub fn metrics_update(metrics: Value) -> Message {
    Message::new(MessageType::MetricsUpdate, json!({ "metrics": metrics }))
        .with_priority(Priority::Low)
}

pub fn ping() -> Message {
    Message::new(MessageType::Ping, json!({}))
}

pub fn pong(correlation_id: Option<&str>) -> Message {
    let msg = Message::new(MessageType::Pong, json!({}));
    match correlation_id {
        Some(id) => msg.with_correlation_id(id),
        None => msg,
    }
}
