//! The `dashboard` module is the orchestrator on top of the transport.
//!
//! It turns file-watcher [`ChangeEvent`]s into rate-limited, channel-scoped
//! broadcasts, answers client requests with correlated responses and sends
//! every new client a snapshot of the current state.

pub mod engine;
pub mod events;
pub mod rate_limit;
pub mod requests;
pub mod source;

#[cfg(test)]
mod integration_tests;

pub use engine::{BroadcastResult, BroadcastStats, Dashboard, DashboardStats};
pub use events::ChangeEvent;
pub use rate_limit::{BroadcastQueue, RateLimiter};
pub use requests::{Request, RequestType};
pub use source::{ChangeSource, ConfigSnapshot, DetachedSource, LogQuery};
