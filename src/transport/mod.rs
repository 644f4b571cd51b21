//! The `transport` module owns the WebSocket listener and the live set of
//! client connections.
//!
//! It enforces the resource limits (client capacity, frame size, idle and
//! heartbeat timeouts), handles subscription bookkeeping, and exposes the
//! raw `send`/`broadcast` primitives the dashboard builds on.

pub mod connection;
pub mod manager;
pub mod websocket;

#[cfg(test)]
mod tests;

pub use connection::{ClientId, ClientSummary, ConnectionState, Outbound};
pub use manager::{
    BroadcastOptions, BroadcastOutcome, ConnectionEvent, ConnectionManager, EventReceiver,
    ManagerStats,
};
