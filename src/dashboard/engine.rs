//! Dashboard engine
//!
//! Bridges change events to broadcasts and answers client requests:
//! - change events become typed messages broadcast on their implied channel
//! - broadcasts pass a process-wide rate limiter; overflow is queued FIFO
//!   and drained in small batches, HIGH/CRITICAL traffic bypasses the limit
//! - `request` messages are dispatched on [`RequestType`] and answered with
//!   a `response` or `error` carrying the request id as `correlationId`
//! - new connections get a state snapshot without having to ask
//!
//! Concurrency notes:
//! - Rate limiter, queue and broadcast statistics live in one `Mutex`
//!   owned here. It is taken before the connection manager's lock, never
//!   after, and never held across an `.await`.
//! - Timers and inbound events are handled by a single event-loop task.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dashboard::events::ChangeEvent;
use crate::dashboard::rate_limit::{BroadcastQueue, QueueStats, RateLimiter};
use crate::dashboard::requests::{self, Request, RequestType};
use crate::dashboard::source::{ChangeSource, LogQuery};
use crate::protocol::messages::{self, ErrorCode};
use crate::protocol::{self, Channel, Message, MessageType, Priority};
use crate::transport::{
    BroadcastOptions, BroadcastOutcome, ClientId, ConnectionEvent, ConnectionManager,
    EventReceiver, ManagerStats,
};
use crate::utils::{DashboardError, ProtocolError, SourceError};

/// What happened to a broadcast request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastResult {
    Sent(BroadcastOutcome),
    /// Deferred by the rate limiter; `depth` is the queue length after insert.
    Queued { depth: usize },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub total_broadcasts: u64,
    pub priority_broadcasts: u64,
    pub messages_delivered: u64,
    pub failed_deliveries: u64,
    pub average_latency_ms: f64,
    pub dropped_on_shutdown: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub current_count: u32,
    pub max_messages_per_second: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub connections: ManagerStats,
    pub broadcasts: BroadcastStats,
    pub rate_limit: RateLimitStats,
    pub queue: QueueStats,
}

#[derive(Debug)]
struct Dispatch {
    limiter: RateLimiter,
    queue: BroadcastQueue,
    stats: BroadcastStats,
}

struct Inner {
    settings: Settings,
    manager: ConnectionManager,
    source: Arc<dyn ChangeSource>,
    dispatch: Mutex<Dispatch>,
    started_at: DateTime<Utc>,
    started: Instant,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Dashboard {
    inner: Arc<Inner>,
}

impl Dashboard {
    pub fn new(settings: Settings, source: Arc<dyn ChangeSource>) -> Self {
        let manager = ConnectionManager::new(settings.connection.clone());
        let dispatch = Dispatch {
            limiter: RateLimiter::new(settings.broadcast.max_messages_per_second),
            queue: BroadcastQueue::new(),
            stats: BroadcastStats::default(),
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                settings,
                manager,
                source,
                dispatch: Mutex::new(dispatch),
                started_at: Utc::now(),
                started: Instant::now(),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    fn dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the listener and starts the event loop consuming `changes`.
    pub async fn start(
        &self,
        changes: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> Result<SocketAddr, DashboardError> {
        let (addr, events) = self
            .inner
            .manager
            .start(&self.inner.settings.bind_addr())
            .await?;

        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(self.clone().run(changes, events, shutdown));
        *self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!("Dashboard listening on ws://{addr}");
        Ok(addr)
    }

    /// Stops the event loop, drops queued broadcasts and closes every client.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        {
            let mut dispatch = self.dispatch();
            let dropped = dispatch.queue.clear();
            if dropped > 0 {
                warn!("Dropping {dropped} queued broadcasts on shutdown");
                dispatch.stats.dropped_on_shutdown += dropped as u64;
            }
        }

        self.inner.manager.stop().await;
        info!("Dashboard stopped");
    }

    async fn run(
        self,
        mut changes: mpsc::UnboundedReceiver<ChangeEvent>,
        mut events: EventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let broadcast = &self.inner.settings.broadcast;
        let mut drain = ticker(broadcast.queue_drain_interval_ms);
        let mut window = ticker(1000);
        let mut metrics =
            (broadcast.metrics_interval_ms > 0).then(|| ticker(broadcast.metrics_interval_ms));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(change) = changes.recv() => {
                    self.handle_change(&change);
                }
                Some(event) = events.recv() => self.handle_connection_event(event),
                _ = drain.tick() => {
                    self.drain_queue();
                }
                _ = window.tick() => self.reset_rate_window(),
                _ = tick_optional(&mut metrics) => self.publish_metrics(),
            }
        }
        debug!("Dashboard event loop finished");
    }

    /// Rate-limited broadcast. Never blocks: over the ceiling the message is
    /// queued and `Queued` is returned.
    pub fn broadcast(
        &self,
        message: Message,
        channel: Option<Channel>,
        options: BroadcastOptions,
    ) -> BroadcastResult {
        let mut dispatch = self.dispatch();
        let Dispatch {
            limiter,
            queue,
            stats,
        } = &mut *dispatch;
        if limiter.has_capacity() {
            let outcome = self.send_now(limiter, stats, &message, channel, &options);
            BroadcastResult::Sent(outcome)
        } else {
            let size = match protocol::serialize(&message) {
                Ok(text) => text.len(),
                Err(e) => {
                    // the manager could not send it either
                    warn!("Dropping broadcast {}: {e}", message.kind);
                    return BroadcastResult::Sent(BroadcastOutcome::default());
                }
            };
            let depth = queue.push(message, channel, options, size);
            debug!("Rate limit reached, queued broadcast (depth {depth})");
            BroadcastResult::Queued { depth }
        }
    }

    /// HIGH and CRITICAL messages are sent right away regardless of the rate
    /// window, without consuming it; lower priorities go through
    /// [`broadcast`](Self::broadcast). The message's own channel is used.
    pub fn broadcast_with_priority(&self, mut message: Message, priority: Priority) -> BroadcastResult {
        message.priority = priority;
        let channel = message.channel;

        if !priority.bypasses_rate_limit() {
            return self.broadcast(message, channel, BroadcastOptions::default());
        }

        let mut dispatch = self.dispatch();
        let Dispatch { limiter, stats, .. } = &mut *dispatch;
        stats.priority_broadcasts += 1;
        let options = BroadcastOptions::default();
        let outcome =
            limiter.bypass(|limiter| self.send_now(limiter, stats, &message, channel, &options));
        BroadcastResult::Sent(outcome)
    }

    fn send_now(
        &self,
        limiter: &mut RateLimiter,
        stats: &mut BroadcastStats,
        message: &Message,
        channel: Option<Channel>,
        options: &BroadcastOptions,
    ) -> BroadcastOutcome {
        let started = Instant::now();
        let outcome = self.inner.manager.broadcast(message, channel, options);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        limiter.record();
        stats.total_broadcasts += 1;
        stats.messages_delivered += outcome.delivered as u64;
        stats.failed_deliveries += outcome.failed as u64;
        stats.average_latency_ms +=
            (latency_ms - stats.average_latency_ms) / stats.total_broadcasts as f64;

        debug!(
            "Broadcast {} on {:?}: {}/{} delivered",
            message.kind, channel, outcome.delivered, outcome.attempted
        );
        outcome
    }

    /// Sends up to one batch of queued broadcasts, oldest first, while the
    /// current window has room. Returns how many were sent.
    pub fn drain_queue(&self) -> usize {
        let batch = self.inner.settings.broadcast.queue_batch_size;
        let mut dispatch = self.dispatch();
        let Dispatch {
            limiter,
            queue,
            stats,
        } = &mut *dispatch;
        if queue.is_empty() {
            return 0;
        }

        let mut sent = 0;
        while sent < batch && limiter.has_capacity() {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            debug!(
                "Draining broadcast queued {}ms ago",
                entry.queued_at.elapsed().as_millis()
            );
            self.send_now(limiter, stats, &entry.message, entry.channel, &entry.options);
            sent += 1;
        }
        sent
    }

    pub fn reset_rate_window(&self) {
        self.dispatch().limiter.reset();
    }

    /// Broadcasts the message for one change event.
    pub fn handle_change(&self, change: &ChangeEvent) -> BroadcastResult {
        debug!("Change event {} for {}", change.name(), change.path());
        let message = change.to_message();
        let priority = message.priority;
        self.broadcast_with_priority(message, priority)
    }

    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened(client_id) => self.send_snapshot(client_id),
            ConnectionEvent::Message(client_id, message) => {
                self.handle_client_message(client_id, &message)
            }
            ConnectionEvent::Closed(client_id) => debug!("Client {client_id} left"),
        }
    }

    fn handle_client_message(&self, client_id: ClientId, message: &Message) {
        let reply = match message.kind {
            MessageType::Request => self.handle_request(client_id, message),
            other => messages::error(
                ErrorCode::UnsupportedMessage,
                &format!("unsupported message type: {other}"),
                Some(&message.id),
            ),
        };
        self.inner.manager.send(client_id, &reply);
    }

    /// Builds the reply to a `request`: always exactly one `response` or
    /// `error` whose `correlationId` is the request id.
    pub fn handle_request(&self, client_id: ClientId, request: &Message) -> Message {
        let result =
            Request::from_message(request).and_then(|req| self.dispatch_request(client_id, &req));

        match result {
            Ok(result) => messages::response(&request.id, result),
            Err(e) => {
                warn!("Request {} from {client_id} failed: {e}", request.id);
                messages::error(requests::error_code(&e), &e.to_string(), Some(&request.id))
            }
        }
    }

    fn dispatch_request(&self, client_id: ClientId, request: &Request) -> Result<Value, DashboardError> {
        debug!("{client_id} requested {:?}", request.request_type);
        match request.request_type {
            RequestType::GetStats => to_json(&self.stats()),
            RequestType::GetConfig => {
                let snapshot = self
                    .inner
                    .source
                    .current_config()
                    .ok_or(SourceError::Unavailable("configuration"))?;
                to_json(&snapshot)
            }
            RequestType::GetLogs => {
                let query: LogQuery = serde_json::from_value(request.params.clone())
                    .map_err(|e| DashboardError::InvalidParams(e.to_string()))?;
                Ok(self.inner.source.logs(&query)?)
            }
            RequestType::GetFileWatcherStatus => Ok(self.inner.source.watcher_status()),
            RequestType::GetConnectedClients => {
                let clients = self.inner.manager.clients();
                Ok(json!({ "count": clients.len(), "clients": to_json(&clients)? }))
            }
            RequestType::RefreshState => {
                self.send_snapshot(client_id);
                Ok(json!({ "refreshed": true }))
            }
        }
    }

    /// Server status, watcher status and (when known) the configuration.
    pub fn send_snapshot(&self, client_id: ClientId) {
        let manager = &self.inner.manager;
        manager.send(client_id, &messages::status_update("server", self.server_status()));
        manager.send(
            client_id,
            &messages::status_update("watcher", self.inner.source.watcher_status()),
        );
        if let Some(snapshot) = self.inner.source.current_config() {
            manager.send(
                client_id,
                &messages::config_change(&snapshot.path, snapshot.config),
            );
        }
    }

    fn server_status(&self) -> Value {
        let connections = self.inner.manager.stats();
        json!({
            "running": true,
            "version": env!("CARGO_PKG_VERSION"),
            "startedAt": self.inner.started_at,
            "uptimeSecs": self.inner.started.elapsed().as_secs(),
            "activeConnections": connections.active_connections,
            "maxClients": connections.max_clients,
        })
    }

    pub fn publish_metrics(&self) {
        match to_json(&self.stats()) {
            Ok(metrics) => {
                let message = messages::metrics_update(metrics);
                let priority = message.priority;
                self.broadcast_with_priority(message, priority);
            }
            Err(e) => warn!("Failed to encode metrics: {e}"),
        }
    }

    pub fn stats(&self) -> DashboardStats {
        // manager lock first and released, then our own
        let connections = self.inner.manager.stats();
        let dispatch = self.dispatch();
        DashboardStats {
            started_at: self.inner.started_at,
            uptime_secs: self.inner.started.elapsed().as_secs(),
            connections,
            broadcasts: dispatch.stats.clone(),
            rate_limit: RateLimitStats {
                current_count: dispatch.limiter.count(),
                max_messages_per_second: dispatch.limiter.ceiling(),
            },
            queue: dispatch.queue.stats(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.dispatch().queue.len()
    }

    pub fn rate_count(&self) -> u32 {
        self.dispatch().limiter.count()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, DashboardError> {
    serde_json::to_value(value)
        .map_err(|e| DashboardError::Protocol(ProtocolError::Serialization(e.to_string())))
}

fn ticker(period_ms: u64) -> Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
