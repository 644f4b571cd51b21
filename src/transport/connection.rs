//! Server-side view of one client connection.

use std::collections::HashSet;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::protocol::Channel;

pub type ClientId = u64;

/// Lifecycle of a connection. Only `Open` connections receive sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Instructions for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(WsMessage),
    /// Send a close frame, then stop writing.
    Close(CloseCode, &'static str),
    /// Drop the socket without a closing handshake.
    Terminate,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
pub struct Connection {
    pub client_id: ClientId,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_alive: bool,
    pub state: ConnectionState,
    pub subscriptions: HashSet<Channel>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub sender: OutboundSender,
}

impl Connection {
    pub fn new(client_id: ClientId, remote_addr: Option<SocketAddr>, sender: OutboundSender) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            remote_addr,
            connected_at: now,
            last_activity: now,
            is_alive: true,
            state: ConnectionState::Connecting,
            subscriptions: HashSet::new(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            sender,
        }
    }

    /// Whether a broadcast filtered by `channel` reaches this connection.
    pub fn accepts(&self, channel: Option<Channel>) -> bool {
        match channel {
            None => true,
            Some(ch) => {
                self.subscriptions.contains(&ch) || self.subscriptions.contains(&Channel::All)
            }
        }
    }

    pub fn record_inbound(&mut self, bytes: usize) {
        self.last_activity = Utc::now();
        self.bytes_received += bytes as u64;
    }

    pub fn summary(&self) -> ClientSummary {
        let mut subscriptions: Vec<Channel> = self.subscriptions.iter().copied().collect();
        subscriptions.sort_by_key(|c| c.as_str());
        ClientSummary {
            client_id: self.client_id,
            remote_addr: self.remote_addr.map(|a| a.to_string()),
            connected_at: self.connected_at,
            last_activity: self.last_activity,
            state: self.state,
            subscriptions,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
        }
    }
}

/// Read-only snapshot of a connection, as returned by `getConnectedClients`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub client_id: ClientId,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: ConnectionState,
    pub subscriptions: Vec<Channel>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}
