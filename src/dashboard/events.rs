//! Change events produced by the file watcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Message, messages};

/// One detected change. Adapters may also feed these as JSON, tagged by
/// `event`:
///
/// ```json
/// {"event": "log-added", "path": "/tmp/logs/app.log", "filename": "app.log"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChangeEvent {
    ConfigChange {
        path: String,
        config: Value,
    },
    LogChange {
        path: String,
        filename: String,
        #[serde(default)]
        recent_content: String,
        #[serde(default)]
        line_count: usize,
    },
    LogAdded {
        path: String,
        filename: String,
    },
    LogRemoved {
        path: String,
        filename: String,
    },
    ProjectConfigChange {
        path: String,
        #[serde(default)]
        project: Option<String>,
        config: Value,
    },
}

impl ChangeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::ConfigChange { .. } => "config-change",
            ChangeEvent::LogChange { .. } => "log-change",
            ChangeEvent::LogAdded { .. } => "log-added",
            ChangeEvent::LogRemoved { .. } => "log-removed",
            ChangeEvent::ProjectConfigChange { .. } => "project-config-change",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::ConfigChange { path, .. }
            | ChangeEvent::LogChange { path, .. }
            | ChangeEvent::LogAdded { path, .. }
            | ChangeEvent::LogRemoved { path, .. }
            | ChangeEvent::ProjectConfigChange { path, .. } => path,
        }
    }

    /// Typed protocol message for this event, channel and priority included.
    pub fn to_message(&self) -> Message {
        match self {
            ChangeEvent::ConfigChange { path, config } => {
                messages::config_change(path, config.clone())
            }
            ChangeEvent::LogChange {
                path,
                filename,
                recent_content,
                line_count,
            } => messages::log_change(path, filename, recent_content, *line_count),
            ChangeEvent::LogAdded { path, filename } => messages::log_added(path, filename),
            ChangeEvent::LogRemoved { path, filename } => messages::log_removed(path, filename),
            ChangeEvent::ProjectConfigChange {
                path,
                project,
                config,
            } => messages::project_config_change(path, project.as_deref(), config.clone()),
        }
    }
}
