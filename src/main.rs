use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use dashsync::config::load_config;
use dashsync::dashboard::{ChangeEvent, Dashboard, DetachedSource};
use dashsync::utils::logging;

/// Forwards newline-delimited JSON change events from stdin.
async fn read_changes(changes: mpsc::UnboundedSender<ChangeEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<ChangeEvent>(&line) {
                Ok(event) => {
                    if changes.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed change event: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read change events from stdin: {e}");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let dashboard = Dashboard::new(settings, Arc::new(DetachedSource));
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_changes(changes_tx));

    if let Err(e) = dashboard.start(changes_rx).await {
        error!("Failed to start dashboard server: {e}");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down");
    dashboard.stop().await;
}
