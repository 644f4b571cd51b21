use serde_json::json;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use super::connection::Outbound;
use super::*;
use crate::config::{ConnectionSettings, Settings};
use crate::protocol::messages;
use crate::protocol::{self, Channel, Message, MessageType};

fn test_settings(max_clients: usize) -> ConnectionSettings {
    ConnectionSettings {
        max_clients,
        ..Settings::default().connection
    }
}

fn connect(manager: &ConnectionManager) -> (ClientId, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client_id = manager.register(None, tx).unwrap();
    manager.open(client_id);
    // drop the welcome frame
    let welcome = next_message(&mut rx);
    assert_eq!(welcome.kind, MessageType::Connection);
    (client_id, rx)
}

fn next_message(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Message {
    match rx.try_recv().expect("expected an outbound frame") {
        Outbound::Frame(WsMessage::Text(text)) => protocol::deserialize(text.as_bytes()).unwrap(),
        other => panic!("Expected a text frame, got {other:?}"),
    }
}

fn subscribe(manager: &ConnectionManager, client_id: ClientId, channels: &[Channel]) {
    let raw = protocol::serialize(&messages::subscribe(channels)).unwrap();
    manager.handle_payload(client_id, raw.as_bytes());
}

#[test]
fn test_register_open_sends_welcome_and_event() {
    let manager = ConnectionManager::new(test_settings(10));
    let mut events = manager.attach().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let client_id = manager.register(None, tx).unwrap();
    assert!(!manager.is_open(client_id));
    manager.open(client_id);
    assert!(manager.is_open(client_id));

    let welcome = next_message(&mut rx);
    assert_eq!(welcome.kind, MessageType::Connection);
    assert_eq!(welcome.data["clientId"], client_id);
    assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Opened(client_id));
}

#[test]
fn test_client_ids_are_monotonic() {
    let manager = ConnectionManager::new(test_settings(10));
    let (a, _rx_a) = connect(&manager);
    let (b, _rx_b) = connect(&manager);
    manager.remove(a);
    let (c, _rx_c) = connect(&manager);
    assert!(a < b && b < c);
}

#[test]
fn test_capacity_rejection() {
    let manager = ConnectionManager::new(test_settings(2));
    let (_a, _rx_a) = connect(&manager);
    let (_b, _rx_b) = connect(&manager);

    let (tx, _rx) = mpsc::unbounded_channel::<Outbound>();
    let rejected = manager.register(None, tx);
    assert!(matches!(
        rejected,
        Err(crate::utils::TransportError::AtCapacity(2))
    ));
    assert_eq!(manager.connection_count(), 2);
    assert_eq!(manager.stats().rejected_connections, 1);
}

#[test]
fn test_channel_filtered_broadcast() {
    let manager = ConnectionManager::new(test_settings(10));
    let (logs, mut rx_logs) = connect(&manager);
    let (config, mut rx_config) = connect(&manager);
    let (all, mut rx_all) = connect(&manager);
    let (_none, mut rx_none) = connect(&manager);

    subscribe(&manager, logs, &[Channel::Logs]);
    subscribe(&manager, config, &[Channel::Config]);
    subscribe(&manager, all, &[Channel::All]);
    for rx in [&mut rx_logs, &mut rx_config, &mut rx_all] {
        assert_eq!(next_message(rx).kind, MessageType::Response);
    }

    let msg = messages::log_change("/var/log/app.log", "app.log", "boom", 1);
    let outcome = manager.broadcast(&msg, msg.channel, &BroadcastOptions::default());
    assert_eq!(
        outcome,
        BroadcastOutcome {
            attempted: 2,
            delivered: 2,
            failed: 0
        }
    );

    assert_eq!(next_message(&mut rx_logs).kind, MessageType::LogChange);
    assert_eq!(next_message(&mut rx_all).kind, MessageType::LogChange);
    assert!(rx_config.try_recv().is_err());
    assert!(rx_none.try_recv().is_err());
}

#[test]
fn test_unfiltered_broadcast_reaches_unsubscribed_clients() {
    let manager = ConnectionManager::new(test_settings(10));
    let (_a, mut rx_a) = connect(&manager);
    let (b, mut rx_b) = connect(&manager);

    let msg = messages::ping();
    let outcome = manager.broadcast(&msg, None, &BroadcastOptions { exclude: Some(b) });
    assert_eq!(outcome.delivered, 1);
    assert_eq!(next_message(&mut rx_a).kind, MessageType::Ping);
    assert!(rx_b.try_recv().is_err());
}

#[test]
fn test_failed_send_does_not_abort_broadcast() {
    let manager = ConnectionManager::new(test_settings(10));
    let (_gone, rx_gone) = connect(&manager);
    let (_alive, mut rx_alive) = connect(&manager);
    drop(rx_gone);

    let outcome = manager.broadcast(&messages::ping(), None, &BroadcastOptions::default());
    assert_eq!(outcome.attempted, 2);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(next_message(&mut rx_alive).kind, MessageType::Ping);
    assert_eq!(manager.stats().failed_sends, 1);
}

#[test]
fn test_send_to_unknown_or_closing_client_is_a_noop() {
    let manager = ConnectionManager::new(test_settings(10));
    assert!(!manager.send(42, &messages::ping()));

    let (client_id, mut rx) = connect(&manager);
    manager.close(client_id, CloseCode::Normal, "bye");
    assert!(matches!(
        rx.try_recv(),
        Ok(Outbound::Close(CloseCode::Normal, "bye"))
    ));
    assert!(!manager.send(client_id, &messages::ping()));
}

#[test]
fn test_subscribe_and_unsubscribe_are_acknowledged() {
    let manager = ConnectionManager::new(test_settings(10));
    let (client_id, mut rx) = connect(&manager);

    let sub = messages::subscribe(&[Channel::Logs, Channel::Config]);
    manager.handle_payload(client_id, protocol::serialize(&sub).unwrap().as_bytes());
    let ack = next_message(&mut rx);
    assert_eq!(ack.kind, MessageType::Response);
    assert_eq!(ack.correlation_id.as_deref(), Some(sub.id.as_str()));
    assert_eq!(ack.data["result"]["subscriptions"], json!(["config", "logs"]));

    let unsub = messages::unsubscribe(&[Channel::Config]);
    manager.handle_payload(client_id, protocol::serialize(&unsub).unwrap().as_bytes());
    let ack = next_message(&mut rx);
    assert_eq!(ack.data["result"]["subscriptions"], json!(["logs"]));

    let clients = manager.clients();
    assert_eq!(clients[0].subscriptions, vec![Channel::Logs]);
}

#[test]
fn test_subscribe_to_unknown_channel_is_an_error() {
    let manager = ConnectionManager::new(test_settings(10));
    let (client_id, mut rx) = connect(&manager);

    let raw = json!({
        "type": "subscribe",
        "id": "sub-1",
        "timestamp": 1,
        "data": { "channels": ["logs", "music"] }
    })
    .to_string();
    manager.handle_payload(client_id, raw.as_bytes());

    let reply = next_message(&mut rx);
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.correlation_id.as_deref(), Some("sub-1"));
    assert!(manager.clients()[0].subscriptions.is_empty());
}

#[test]
fn test_malformed_payload_gets_error_and_connection_survives() {
    let manager = ConnectionManager::new(test_settings(10));
    let (client_id, mut rx) = connect(&manager);
    let (_other, mut rx_other) = connect(&manager);

    manager.handle_payload(client_id, b"{not json");
    let reply = next_message(&mut rx);
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.data["code"], "INVALID_MESSAGE");
    assert!(manager.is_open(client_id));
    assert!(rx_other.try_recv().is_err());
}

#[test]
fn test_invalid_request_error_carries_request_id() {
    let manager = ConnectionManager::new(test_settings(10));
    let mut events = manager.attach().unwrap();
    let (client_id, mut rx) = connect(&manager);
    let _ = events.try_recv();

    let raw = json!({
        "version": "1.0",
        "type": "request",
        "id": "abc123",
        "timestamp": 1_700_000_000_000_i64,
        "data": { "requestType": 42 }
    });
    manager.handle_payload(client_id, raw.to_string().as_bytes());

    let reply = next_message(&mut rx);
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.data["code"], "INVALID_PARAMS");
    assert_eq!(reply.correlation_id.as_deref(), Some("abc123"));
    assert!(rx.try_recv().is_err());
    assert!(events.try_recv().is_err());
}

#[test]
fn test_invalid_subscribe_error_carries_message_id() {
    let manager = ConnectionManager::new(test_settings(10));
    let (client_id, mut rx) = connect(&manager);

    let raw = json!({
        "version": "1.0",
        "type": "subscribe",
        "id": "sub-1",
        "timestamp": 1_700_000_000_000_i64,
        "data": { "channels": [] }
    });
    manager.handle_payload(client_id, raw.to_string().as_bytes());

    let reply = next_message(&mut rx);
    assert_eq!(reply.data["code"], "INVALID_MESSAGE");
    assert_eq!(reply.correlation_id.as_deref(), Some("sub-1"));
}

#[test]
fn test_requests_are_forwarded_as_events() {
    let manager = ConnectionManager::new(test_settings(10));
    let mut events = manager.attach().unwrap();
    let (client_id, _rx) = connect(&manager);
    assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Opened(client_id));

    let request = messages::request("getStats", json!({}));
    manager.handle_payload(client_id, protocol::serialize(&request).unwrap().as_bytes());

    match events.try_recv().unwrap() {
        ConnectionEvent::Message(id, msg) => {
            assert_eq!(id, client_id);
            assert_eq!(msg, request);
        }
        other => panic!("Expected a forwarded message, got {other:?}"),
    }
    assert_eq!(manager.stats().messages_received, 1);
}

#[test]
fn test_protocol_ping_is_answered_with_pong() {
    let manager = ConnectionManager::new(test_settings(10));
    let (client_id, mut rx) = connect(&manager);

    let ping = messages::ping();
    manager.handle_payload(client_id, protocol::serialize(&ping).unwrap().as_bytes());
    let pong = next_message(&mut rx);
    assert_eq!(pong.kind, MessageType::Pong);
    assert_eq!(pong.correlation_id, Some(ping.id));
}

#[test]
fn test_heartbeat_terminates_after_two_missed_ticks() {
    let manager = ConnectionManager::new(test_settings(10));
    let mut events = manager.attach().unwrap();
    let (client_id, mut rx) = connect(&manager);
    let _ = events.try_recv();

    manager.heartbeat_tick();
    assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(WsMessage::Ping(_)))));

    // answering the ping keeps the connection for another round
    manager.mark_alive(client_id);
    manager.heartbeat_tick();
    assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(WsMessage::Ping(_)))));
    assert_eq!(manager.connection_count(), 1);

    // no pong this time
    manager.heartbeat_tick();
    assert!(matches!(rx.try_recv(), Ok(Outbound::Terminate)));
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.stats().heartbeat_terminations, 1);
    assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Closed(client_id));
}

#[test]
fn test_remove_emits_closed_once() {
    let manager = ConnectionManager::new(test_settings(10));
    let mut events = manager.attach().unwrap();
    let (client_id, _rx) = connect(&manager);
    let _ = events.try_recv();

    let last = manager.remove(client_id).unwrap();
    assert_eq!(last.state, ConnectionState::Closed);
    assert_eq!(last.messages_sent, 1);
    assert!(manager.remove(client_id).is_none());
    assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Closed(client_id));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_idle_timeout_counts_and_closes_normally() {
    let manager = ConnectionManager::new(test_settings(10));
    let (client_id, mut rx) = connect(&manager);

    manager.idle_timeout(client_id);
    assert!(matches!(
        rx.try_recv(),
        Ok(Outbound::Close(CloseCode::Normal, "idle timeout"))
    ));
    assert_eq!(manager.stats().timeout_disconnections, 1);
}

#[test]
fn test_attach_twice_fails() {
    let manager = ConnectionManager::new(test_settings(10));
    let _events = manager.attach().unwrap();
    assert!(matches!(
        manager.attach(),
        Err(crate::utils::TransportError::AlreadyStarted)
    ));
}
