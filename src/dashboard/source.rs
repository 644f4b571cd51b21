//! Query side of the change source.
//!
//! Events arrive over a channel (see [`ChangeEvent`](super::ChangeEvent));
//! request handlers read current state through this trait.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::utils::SourceError;

/// Parameters of a `getLogs` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogQuery {
    /// Restrict to one log file.
    pub file: Option<String>,
    /// Number of trailing lines to return.
    pub lines: Option<usize>,
}

/// Configuration currently in effect and the file it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub path: String,
    pub config: Value,
}

pub trait ChangeSource: Send + Sync {
    fn watcher_status(&self) -> Value;

    /// `None` while nothing has been loaded.
    fn current_config(&self) -> Option<ConfigSnapshot>;

    fn logs(&self, query: &LogQuery) -> Result<Value, SourceError>;
}

/// Stand-in when no watcher is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSource;

impl ChangeSource for DetachedSource {
    fn watcher_status(&self) -> Value {
        json!({ "watching": false, "paths": [] })
    }

    fn current_config(&self) -> Option<ConfigSnapshot> {
        None
    }

    fn logs(&self, _query: &LogQuery) -> Result<Value, SourceError> {
        Err(SourceError::Unavailable("log source"))
    }
}
