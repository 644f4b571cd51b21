use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the listener address, per-connection limits, broadcast
/// backpressure knobs and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub connection: ConnectionSettings,
    pub broadcast: BroadcastSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket listener binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Resource bounds applied to every client connection.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    pub max_clients: usize,
    /// Largest inbound frame/message accepted, in bytes.
    pub max_message_size: usize,
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
}

/// Rate limiting and queue draining for dashboard broadcasts.
#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastSettings {
    pub max_messages_per_second: u32,
    pub queue_drain_interval_ms: u64,
    pub queue_batch_size: usize,
    /// Period of `metrics-update` broadcasts; `0` disables them.
    pub metrics_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub connection: Option<PartialConnectionSettings>,
    pub broadcast: Option<PartialBroadcastSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConnectionSettings {
    pub max_clients: Option<usize>,
    pub max_message_size: Option<usize>,
    pub heartbeat_interval_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBroadcastSettings {
    pub max_messages_per_second: Option<u32>,
    pub queue_drain_interval_ms: Option<u64>,
    pub queue_batch_size: Option<usize>,
    pub metrics_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `base`.
    pub fn merge_over(self, base: Settings) -> Settings {
        let server = self.server;
        let connection = self.connection;
        let broadcast = self.broadcast;
        let logging = self.logging;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(base.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(base.server.port),
            },
            connection: ConnectionSettings {
                max_clients: connection
                    .as_ref()
                    .and_then(|c| c.max_clients)
                    .unwrap_or(base.connection.max_clients),
                max_message_size: connection
                    .as_ref()
                    .and_then(|c| c.max_message_size)
                    .unwrap_or(base.connection.max_message_size),
                heartbeat_interval_ms: connection
                    .as_ref()
                    .and_then(|c| c.heartbeat_interval_ms)
                    .unwrap_or(base.connection.heartbeat_interval_ms),
                idle_timeout_ms: connection
                    .as_ref()
                    .and_then(|c| c.idle_timeout_ms)
                    .unwrap_or(base.connection.idle_timeout_ms),
            },
            broadcast: BroadcastSettings {
                max_messages_per_second: broadcast
                    .as_ref()
                    .and_then(|b| b.max_messages_per_second)
                    .unwrap_or(base.broadcast.max_messages_per_second),
                queue_drain_interval_ms: broadcast
                    .as_ref()
                    .and_then(|b| b.queue_drain_interval_ms)
                    .unwrap_or(base.broadcast.queue_drain_interval_ms),
                queue_batch_size: broadcast
                    .as_ref()
                    .and_then(|b| b.queue_batch_size)
                    .unwrap_or(base.broadcast.queue_batch_size),
                metrics_interval_ms: broadcast
                    .as_ref()
                    .and_then(|b| b.metrics_interval_ms)
                    .unwrap_or(base.broadcast.metrics_interval_ms),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(base.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8765,
            },
            connection: ConnectionSettings {
                max_clients: 1000,
                max_message_size: 1024 * 1024,
                heartbeat_interval_ms: 30_000,
                idle_timeout_ms: 300_000,
            },
            broadcast: BroadcastSettings {
                max_messages_per_second: 100,
                queue_drain_interval_ms: 100,
                queue_batch_size: 10,
                metrics_interval_ms: 10_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Address the listener binds to, `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
