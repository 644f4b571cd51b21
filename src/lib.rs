//! # DashSync
//!
//! `dashsync` is a real-time synchronization server for developer dashboards.
//! It pushes configuration and log file changes to connected WebSocket
//! clients and answers their state queries.
//!
//! ## Core Modules
//!
//! - `protocol`: The JSON message envelope, typed constructors and the codec.
//! - `transport`: The WebSocket listener, connection lifecycle and subscriptions.
//! - `dashboard`: Rate-limited broadcasting of change events and request handling.
//! - `config`: Loading server settings from files and the environment.
//! - `utils`: Error types and logging setup.

pub mod config;
pub mod dashboard;
pub mod protocol;
pub mod transport;
pub mod utils;
