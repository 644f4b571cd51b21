//! The `utils` module provides shared pieces used across `dashsync`:
//! the error types every layer returns and the tracing setup.

pub mod error;
pub mod logging;

pub use error::{DashboardError, ProtocolError, SourceError, TransportError};
