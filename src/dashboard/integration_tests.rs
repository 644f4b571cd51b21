use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use super::*;
use crate::config::Settings;
use crate::protocol::{self, Channel, Message, MessageType, messages};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = 0;
    settings.broadcast.metrics_interval_ms = 0;
    settings
}

async fn start() -> (Dashboard, SocketAddr, mpsc::UnboundedSender<ChangeEvent>) {
    let dashboard = Dashboard::new(settings(), Arc::new(DetachedSource));
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();
    let addr = dashboard
        .start(changes_rx)
        .await
        .expect("Failed to start dashboard");
    (dashboard, addr, changes_tx)
}

/// Connects and consumes the welcome plus the two status updates of the
/// snapshot.
async fn connect(addr: SocketAddr) -> (Client, u64) {
    let (mut ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("WebSocket handshake failed");
    let welcome = next_message(&mut ws).await;
    assert_eq!(welcome.kind, MessageType::Connection);
    let client_id = welcome.data["clientId"].as_u64().unwrap();
    for component in ["server", "watcher"] {
        let status = next_message(&mut ws).await;
        assert_eq!(status.kind, MessageType::StatusUpdate);
        assert_eq!(status.data["component"], component);
    }
    (ws, client_id)
}

async fn next_frame(ws: &mut Client) -> WsMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Stream ended")
            .expect("Read error");
        if !matches!(frame, WsMessage::Ping(_) | WsMessage::Pong(_)) {
            return frame;
        }
    }
}

async fn next_message(ws: &mut Client) -> Message {
    match next_frame(ws).await {
        WsMessage::Text(text) => protocol::deserialize(text.as_bytes()).unwrap(),
        other => panic!("Expected a text frame, got {other:?}"),
    }
}

async fn send(ws: &mut Client, message: &Message) {
    let text = protocol::serialize(message).unwrap();
    ws.send(WsMessage::text(text)).await.unwrap();
}

async fn expect_silence(ws: &mut Client) {
    let waited = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(waited.is_err(), "Expected no frame, got {waited:?}");
}

#[tokio::test]
async fn test_new_client_gets_state_snapshot() {
    let (dashboard, addr, _changes) = start().await;
    let (_ws, client_id) = connect(addr).await;

    assert!(client_id > 0);
    assert_eq!(dashboard.manager().connection_count(), 1);
    dashboard.stop().await;
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let (dashboard, addr, _changes) = start().await;
    let (mut ws, _) = connect(addr).await;

    let mut request = messages::request("getStats", json!({}));
    request.id = "abc123".to_string();
    send(&mut ws, &request).await;

    let reply = next_message(&mut ws).await;
    assert_eq!(reply.kind, MessageType::Response);
    assert_eq!(reply.correlation_id.as_deref(), Some("abc123"));
    assert_eq!(reply.data["result"]["connections"]["activeConnections"], 1);

    let mut unknown = messages::request("getWeather", json!({}));
    unknown.id = "xyz".to_string();
    send(&mut ws, &unknown).await;
    let reply = next_message(&mut ws).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.correlation_id.as_deref(), Some("xyz"));
    assert_eq!(reply.data["code"], "UNKNOWN_REQUEST");

    dashboard.stop().await;
}

#[tokio::test]
async fn test_change_events_reach_subscribers_only() {
    let (dashboard, addr, changes) = start().await;
    let (mut logs, _) = connect(addr).await;
    let (mut config, _) = connect(addr).await;

    send(&mut logs, &messages::subscribe(&[Channel::Logs])).await;
    assert_eq!(next_message(&mut logs).await.kind, MessageType::Response);
    send(&mut config, &messages::subscribe(&[Channel::Config])).await;
    assert_eq!(next_message(&mut config).await.kind, MessageType::Response);

    changes
        .send(ChangeEvent::LogAdded {
            path: "/project/logs/new.log".to_string(),
            filename: "new.log".to_string(),
        })
        .unwrap();

    let added = next_message(&mut logs).await;
    assert_eq!(added.kind, MessageType::LogAdded);
    assert_eq!(added.channel, Some(Channel::Logs));
    assert_eq!(added.data["filename"], "new.log");
    expect_silence(&mut config).await;

    changes
        .send(ChangeEvent::ConfigChange {
            path: "/project/config.json".to_string(),
            config: json!({ "debug": true }),
        })
        .unwrap();
    let change = next_message(&mut config).await;
    assert_eq!(change.kind, MessageType::ConfigChange);
    assert_eq!(change.data["config"]["debug"], true);
    expect_silence(&mut logs).await;

    dashboard.stop().await;
}

#[tokio::test]
async fn test_stop_closes_clients_normally() {
    let (dashboard, addr, _changes) = start().await;
    let (mut ws, _) = connect(addr).await;

    dashboard.stop().await;

    match next_frame(&mut ws).await {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason.as_str(), "server shutdown");
        }
        other => panic!("Expected a close frame, got {other:?}"),
    }
    assert_eq!(dashboard.manager().connection_count(), 0);
}
