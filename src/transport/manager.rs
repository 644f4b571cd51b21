//! Connection manager
//!
//! Owns the live-connection set and everything that mutates it:
//! - registering accepted sockets, enforcing `max_clients`
//! - routing inbound frames (subscriptions and protocol pings are handled
//!   here, everything else is forwarded as a [`ConnectionEvent`])
//! - unicast `send` and channel-filtered `broadcast`
//! - the heartbeat sweep and idle-timeout bookkeeping
//!
//! Concurrency notes:
//! - All state sits behind one `Mutex` that is never held across an
//!   `.await`. Socket writes go through each connection's unbounded
//!   outbound channel, so a broadcast is a non-blocking loop.
//! - The manager never calls into its consumer while locked; it only pushes
//!   onto the event channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::config::ConnectionSettings;
use crate::protocol::messages::{self, ErrorCode};
use crate::protocol::{self, Channel, Message, MessageType};
use crate::transport::connection::{
    ClientId, ClientSummary, Connection, ConnectionState, Outbound, OutboundSender,
};
use crate::transport::websocket;
use crate::utils::TransportError;

/// What the manager reports to its consumer (the dashboard).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake done and welcome queued; the client can receive sends.
    Opened(ClientId),
    /// A valid inbound message the manager does not handle itself.
    Message(ClientId, Message),
    Closed(ClientId),
}

pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOptions {
    /// Skip this client.
    pub exclude: Option<ClientId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub timeout_disconnections: u64,
    pub heartbeat_terminations: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub failed_sends: u64,
    pub max_clients: usize,
    pub max_message_size: usize,
}

#[derive(Debug, Default)]
struct ManagerState {
    connections: HashMap<ClientId, Connection>,
    stats: ManagerStats,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    running: bool,
}

impl ManagerState {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    settings: ConnectionSettings,
    state: Arc<Mutex<ManagerState>>,
    next_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        let stats = ManagerStats {
            max_clients: settings.max_clients,
            max_message_size: settings.max_message_size,
            ..ManagerStats::default()
        };
        Self {
            settings,
            state: Arc::new(Mutex::new(ManagerState {
                stats,
                ..ManagerState::default()
            })),
            next_id: Arc::new(AtomicU64::new(1)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `addr` and starts accepting and heartbeating.
    ///
    /// Returns the bound address (useful with port 0) and the event stream.
    pub async fn start(&self, addr: &str) -> Result<(SocketAddr, EventReceiver), TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let events = self.attach()?;

        let accept = tokio::spawn(websocket::accept_loop(listener, self.clone()));
        let heartbeat = tokio::spawn(self.clone().run_heartbeat());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([accept, heartbeat]);

        info!("WebSocket server listening on ws://{local_addr}");
        Ok((local_addr, events))
    }

    /// Marks the manager running and creates the event channel, without
    /// binding a socket.
    pub(crate) fn attach(&self) -> Result<EventReceiver, TransportError> {
        let mut state = self.lock();
        if state.running {
            return Err(TransportError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        state.running = true;
        Ok(rx)
    }

    /// Closes every connection with 1000, stops the timers and releases the port.
    pub async fn stop(&self) {
        {
            let mut state = self.lock();
            state.running = false;
            for (client_id, conn) in state.connections.iter_mut() {
                conn.state = ConnectionState::Closing;
                let _ = conn
                    .sender
                    .send(Outbound::Close(CloseCode::Normal, "server shutdown"));
                debug!("Closing client {client_id} for shutdown");
            }
            state.connections.clear();
            state.stats.active_connections = 0;
            state.events = None;
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Connection manager stopped");
    }

    /// Admits a new connection or rejects it when at capacity.
    ///
    /// The capacity check and the insert happen under one lock, so
    /// concurrent handshakes cannot overshoot `max_clients`.
    pub fn register(
        &self,
        remote_addr: Option<SocketAddr>,
        sender: OutboundSender,
    ) -> Result<ClientId, TransportError> {
        let mut state = self.lock();
        if state.connections.len() >= self.settings.max_clients {
            state.stats.rejected_connections += 1;
            return Err(TransportError::AtCapacity(self.settings.max_clients));
        }

        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state
            .connections
            .insert(client_id, Connection::new(client_id, remote_addr, sender));
        state.stats.total_connections += 1;
        state.stats.active_connections = state.connections.len();
        Ok(client_id)
    }

    /// Queues the welcome message and moves the connection to `Open`.
    pub fn open(&self, client_id: ClientId) {
        let welcome = messages::connection_ack(client_id, env!("CARGO_PKG_VERSION"));
        let text = match protocol::serialize(&welcome) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize welcome for {client_id}: {e}");
                return;
            }
        };

        let mut state = self.lock();
        let ManagerState {
            connections, stats, ..
        } = &mut *state;
        let Some(conn) = connections.get_mut(&client_id) else {
            return;
        };
        deliver(conn, &text, stats);
        conn.state = ConnectionState::Open;
        info!("Client {client_id} connected");
        state.emit(ConnectionEvent::Opened(client_id));
    }

    /// Sends one message to one client. Returns whether it was queued on the
    /// socket; failures are logged and counted, never raised.
    pub fn send(&self, client_id: ClientId, message: &Message) -> bool {
        let text = match protocol::serialize(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize {} for {client_id}: {e}", message.kind);
                self.lock().stats.failed_sends += 1;
                return false;
            }
        };

        let mut state = self.lock();
        let ManagerState {
            connections, stats, ..
        } = &mut *state;
        match connections.get_mut(&client_id) {
            Some(conn) if conn.state == ConnectionState::Open => deliver(conn, &text, stats),
            _ => {
                debug!("Dropping {} for closed client {client_id}", message.kind);
                false
            }
        }
    }

    /// Sends `message` to every open connection accepted by `channel`.
    pub fn broadcast(
        &self,
        message: &Message,
        channel: Option<Channel>,
        options: &BroadcastOptions,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let text = match protocol::serialize(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize broadcast {}: {e}", message.kind);
                return outcome;
            }
        };

        let mut state = self.lock();
        let ManagerState {
            connections, stats, ..
        } = &mut *state;
        for conn in connections.values_mut() {
            if conn.state != ConnectionState::Open
                || options.exclude == Some(conn.client_id)
                || !conn.accepts(channel)
            {
                continue;
            }
            outcome.attempted += 1;
            if deliver(conn, &text, stats) {
                outcome.delivered += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }

    /// Entry point for every inbound data frame of `client_id`.
    pub fn handle_payload(&self, client_id: ClientId, payload: &[u8]) {
        {
            let mut state = self.lock();
            let ManagerState {
                connections, stats, ..
            } = &mut *state;
            let Some(conn) = connections.get_mut(&client_id) else {
                return;
            };
            conn.messages_received += 1;
            stats.messages_received += 1;
        }

        let message = match protocol::deserialize(payload) {
            Ok(message) => message,
            Err(e) => {
                let preview = String::from_utf8_lossy(&payload[..payload.len().min(100)]);
                warn!("Invalid message from {client_id}: {e} | {preview}");
                let reply = messages::error(ErrorCode::InvalidMessage, &e.to_string(), None);
                self.send(client_id, &reply);
                return;
            }
        };

        // the envelope parsed, so the reply can carry its id
        if let Err(e) = protocol::validate(&message).into_result() {
            warn!("Invalid {} {} from {client_id}: {e}", message.kind, message.id);
            let code = if message.kind == MessageType::Request {
                ErrorCode::InvalidParams
            } else {
                ErrorCode::InvalidMessage
            };
            let correlation_id = (!message.id.is_empty()).then_some(message.id.as_str());
            self.send(client_id, &messages::error(code, &e.to_string(), correlation_id));
            return;
        }

        match message.kind {
            MessageType::Subscribe | MessageType::Unsubscribe => {
                self.handle_subscription(client_id, &message)
            }
            MessageType::Ping => {
                self.send(client_id, &messages::pong(Some(&message.id)));
            }
            MessageType::Pong => {
                self.mark_alive(client_id);
            }
            _ => {
                self.lock()
                    .emit(ConnectionEvent::Message(client_id, message));
            }
        }
    }

    fn handle_subscription(&self, client_id: ClientId, message: &Message) {
        let requested: Vec<&str> = message
            .data
            .get("channels")
            .and_then(|c| c.as_array())
            .map(|list| list.iter().filter_map(|c| c.as_str()).collect())
            .unwrap_or_default();

        let channels: Result<Vec<Channel>, String> =
            requested.iter().map(|c| c.parse::<Channel>()).collect();
        let channels = match channels {
            Ok(channels) => channels,
            Err(e) => {
                let reply = messages::error(ErrorCode::InvalidParams, &e, Some(&message.id));
                self.send(client_id, &reply);
                return;
            }
        };

        let current = {
            let mut state = self.lock();
            let Some(conn) = state.connections.get_mut(&client_id) else {
                return;
            };
            for channel in &channels {
                if message.kind == MessageType::Subscribe {
                    conn.subscriptions.insert(*channel);
                } else {
                    conn.subscriptions.remove(channel);
                }
            }
            conn.summary().subscriptions
        };

        debug!("{client_id} {} {:?}", message.kind, channels);
        let reply = messages::response(
            &message.id,
            serde_json::json!({
                "action": message.kind,
                "channels": channels,
                "subscriptions": current,
            }),
        );
        self.send(client_id, &reply);
    }

    /// Records inbound activity; resets nothing but `last_activity`, the
    /// idle timer itself lives in the connection task.
    pub fn touch(&self, client_id: ClientId, bytes: usize) {
        let mut state = self.lock();
        let ManagerState {
            connections, stats, ..
        } = &mut *state;
        if let Some(conn) = connections.get_mut(&client_id) {
            conn.record_inbound(bytes);
            stats.bytes_received += bytes as u64;
        }
    }

    pub fn mark_alive(&self, client_id: ClientId) {
        if let Some(conn) = self.lock().connections.get_mut(&client_id) {
            conn.is_alive = true;
        }
    }

    /// Starts a graceful close of one connection.
    pub fn close(&self, client_id: ClientId, code: CloseCode, reason: &'static str) {
        if let Some(conn) = self.lock().connections.get_mut(&client_id) {
            conn.state = ConnectionState::Closing;
            let _ = conn.sender.send(Outbound::Close(code, reason));
        }
    }

    pub(crate) fn idle_timeout(&self, client_id: ClientId) {
        info!("Client {client_id} idle for {}ms, closing", self.settings.idle_timeout_ms);
        self.lock().stats.timeout_disconnections += 1;
        self.close(client_id, CloseCode::Normal, "idle timeout");
    }

    /// Drops a connection from the live set. Emits `Closed` once and returns
    /// the connection's final summary.
    pub fn remove(&self, client_id: ClientId) -> Option<ClientSummary> {
        let mut state = self.lock();
        let mut conn = state.connections.remove(&client_id)?;
        conn.state = ConnectionState::Closed;
        state.stats.active_connections = state.connections.len();
        info!(
            "Client {client_id} disconnected ({} sent, {} received)",
            conn.messages_sent, conn.messages_received
        );
        state.emit(ConnectionEvent::Closed(client_id));
        Some(conn.summary())
    }

    /// One heartbeat sweep: terminate connections that missed the previous
    /// ping, ping everyone else.
    pub fn heartbeat_tick(&self) {
        let mut state = self.lock();
        let mut dead = Vec::new();

        for conn in state.connections.values_mut() {
            if !conn.is_alive {
                dead.push(conn.client_id);
                continue;
            }
            conn.is_alive = false;
            let _ = conn.sender.send(Outbound::Frame(WsMessage::Ping(Default::default())));
        }

        for client_id in dead {
            if let Some(conn) = state.connections.remove(&client_id) {
                warn!("Client {client_id} missed heartbeat, terminating");
                let _ = conn.sender.send(Outbound::Terminate);
                state.stats.heartbeat_terminations += 1;
                state.emit(ConnectionEvent::Closed(client_id));
            }
        }
        state.stats.active_connections = state.connections.len();
    }

    async fn run_heartbeat(self) {
        let period = Duration::from_millis(self.settings.heartbeat_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.heartbeat_tick();
        }
    }

    pub fn is_open(&self, client_id: ClientId) -> bool {
        self.lock()
            .connections
            .get(&client_id)
            .is_some_and(|c| c.state == ConnectionState::Open)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        let mut clients: Vec<ClientSummary> =
            self.lock().connections.values().map(Connection::summary).collect();
        clients.sort_by_key(|c| c.client_id);
        clients
    }

    pub fn stats(&self) -> ManagerStats {
        let state = self.lock();
        ManagerStats {
            active_connections: state.connections.len(),
            ..state.stats.clone()
        }
    }
}

/// Pushes one serialized frame to a connection's writer and updates counters.
fn deliver(conn: &mut Connection, text: &str, stats: &mut ManagerStats) -> bool {
    match conn.sender.send(Outbound::Frame(WsMessage::text(text.to_owned()))) {
        Ok(()) => {
            conn.messages_sent += 1;
            conn.bytes_sent += text.len() as u64;
            stats.messages_sent += 1;
            stats.bytes_sent += text.len() as u64;
            true
        }
        Err(e) => {
            warn!("Failed to send message to {}: {e}", conn.client_id);
            stats.failed_sends += 1;
            false
        }
    }
}
