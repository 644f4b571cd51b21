//! Wire envelope
//!
//! `Message` is the single JSON shape exchanged in both directions. The
//! `data` payload is free-form per message kind; every other field is
//! fixed so the server can route and correlate without looking inside.
//!
//! Notes on fields:
//! - `id`: unique per process lifetime, see [`generate_id`]
//! - `timestamp`: milliseconds since UNIX epoch, advisory for clients only
//! - `channel`: broadcast topic used for subscription filtering
//! - `correlationId`: the `id` of the request a response/error answers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol revision stamped on every outgoing message.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Connection,
    Subscribe,
    Unsubscribe,
    Request,
    Response,
    Error,
    ConfigChange,
    LogChange,
    LogAdded,
    LogRemoved,
    ProjectConfigChange,
    StatusUpdate,
    MetricsUpdate,
    Ping,
    Pong,
}

impl MessageType {
    pub const ALL: [MessageType; 15] = [
        MessageType::Connection,
        MessageType::Subscribe,
        MessageType::Unsubscribe,
        MessageType::Request,
        MessageType::Response,
        MessageType::Error,
        MessageType::ConfigChange,
        MessageType::LogChange,
        MessageType::LogAdded,
        MessageType::LogRemoved,
        MessageType::ProjectConfigChange,
        MessageType::StatusUpdate,
        MessageType::MetricsUpdate,
        MessageType::Ping,
        MessageType::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connection => "connection",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::ConfigChange => "config-change",
            MessageType::LogChange => "log-change",
            MessageType::LogAdded => "log-added",
            MessageType::LogRemoved => "log-removed",
            MessageType::ProjectConfigChange => "project-config-change",
            MessageType::StatusUpdate => "status-update",
            MessageType::MetricsUpdate => "metrics-update",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }

    /// Channel a message of this kind is broadcast on, if any.
    pub fn implied_channel(&self) -> Option<Channel> {
        match self {
            MessageType::ConfigChange | MessageType::ProjectConfigChange => Some(Channel::Config),
            MessageType::LogChange | MessageType::LogAdded | MessageType::LogRemoved => {
                Some(Channel::Logs)
            }
            MessageType::StatusUpdate => Some(Channel::Status),
            MessageType::MetricsUpdate => Some(Channel::Metrics),
            _ => None,
        }
    }

    /// Kinds a client is allowed to send to the server.
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            MessageType::Subscribe
                | MessageType::Unsubscribe
                | MessageType::Request
                | MessageType::Ping
                | MessageType::Pong
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown message type '{s}'"))
    }
}

/// Delivery priority. Serialized as its ordinal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// HIGH and CRITICAL skip the broadcast rate limit.
    pub fn bypasses_rate_limit(&self) -> bool {
        *self >= Priority::High
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(format!("invalid priority {other}, expected 0-3")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority as u8
    }
}

/// Broadcast topic. `All` (`*`) matches every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "logs")]
    Logs,
    #[serde(rename = "metrics")]
    Metrics,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "*")]
    All,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Config => "config",
            Channel::Logs => "logs",
            Channel::Metrics => "metrics",
            Channel::Status => "status",
            Channel::All => "*",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Channel::Config),
            "logs" => Ok(Channel::Logs),
            "metrics" => Ok(Channel::Metrics),
            "status" => Ok(Channel::Status),
            "*" => Ok(Channel::All),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Message {
    /// Fresh message of `kind` carrying `data`, with a new id and the current
    /// time. Channel and priority start from the kind's defaults.
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            version: default_version(),
            kind,
            id: generate_id(),
            timestamp: now_millis(),
            priority: Priority::Normal,
            data,
            channel: kind.implied_channel(),
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channel(mut self, channel: Option<Channel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// String field of the payload, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// `msg_<millis>_<random>`; the random part makes ids unique even when
/// many messages share a millisecond.
pub fn generate_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", now_millis(), &suffix[..12])
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
