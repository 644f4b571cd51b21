//! WebSocket transport
//!
//! Accept loop and per-connection tasks. Each accepted socket is split into
//! a writer task, fed by the connection's outbound channel, and a reader
//! loop that enforces the idle timeout and hands frames to the
//! [`ConnectionManager`].

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage, WebSocketConfig};

use crate::transport::connection::{ClientId, Outbound};
use crate::transport::manager::ConnectionManager;

/// How long a closing connection waits for the peer's close reply.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub(crate) async fn accept_loop(listener: TcpListener, manager: ConnectionManager) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(stream, addr, manager.clone()));
            }
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, manager: ConnectionManager) {
    let max_size = manager.settings().max_message_size;
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(max_size))
        .max_frame_size(Some(max_size));

    let ws_stream = match accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error from {addr}: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let client_id = match manager.register(Some(addr), tx) {
        Ok(client_id) => client_id,
        Err(e) => {
            warn!("Rejecting connection from {addr}: {e}");
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: "at capacity".into(),
            };
            let _ = ws_sender.send(WsMessage::Close(Some(frame))).await;
            let _ = tokio::time::timeout(CLOSE_GRACE, ws_receiver.next()).await;
            return;
        }
    };

    // Resolves with `true` after a close frame went out, `false` when the
    // writer stopped for any other reason.
    let (done_tx, mut done_rx) = oneshot::channel::<bool>();

    let writer = tokio::spawn(async move {
        let mut graceful = false;
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(msg) => {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!("Failed to send message to {client_id}: {e}");
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    graceful = ws_sender.send(WsMessage::Close(Some(frame))).await.is_ok();
                    break;
                }
                Outbound::Terminate => break,
            }
        }
        let _ = done_tx.send(graceful);
        debug!("Send loop closed for {client_id}");
    });

    manager.open(client_id);

    let idle = Duration::from_millis(manager.settings().idle_timeout_ms.max(1));
    // only data frames count as activity; control frames keep it pending
    let idle_deadline = tokio::time::sleep(idle);
    tokio::pin!(idle_deadline);
    let mut reading = true;

    let graceful = loop {
        tokio::select! {
            done = &mut done_rx => break done.unwrap_or(false),
            _ = &mut idle_deadline, if reading => {
                reading = false;
                manager.idle_timeout(client_id);
            }
            next = ws_receiver.next(), if reading => {
                match next {
                    None => break false,
                    Some(Err(tungstenite::Error::Capacity(e))) => {
                        warn!("Client {client_id} sent an oversized frame: {e}");
                        reading = false;
                        manager.close(client_id, CloseCode::Size, "message too big");
                    }
                    Some(Err(e)) => {
                        debug!("Read error from {client_id}: {e}");
                        break false;
                    }
                    Some(Ok(msg)) => {
                        if msg.is_text() || msg.is_binary() {
                            idle_deadline.as_mut().reset(Instant::now() + idle);
                        }
                        handle_frame(&manager, client_id, msg);
                    }
                }
            }
        }
    };

    if graceful {
        // let the peer answer the close frame before the socket is dropped
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(_)) = ws_receiver.next().await {}
        })
        .await;
    }

    manager.remove(client_id);
    writer.abort();
}

fn handle_frame(manager: &ConnectionManager, client_id: ClientId, msg: WsMessage) {
    manager.touch(client_id, msg.len());
    match msg {
        WsMessage::Text(_) | WsMessage::Binary(_) => {
            let payload = msg.into_data();
            manager.handle_payload(client_id, &payload);
        }
        WsMessage::Pong(_) => manager.mark_alive(client_id),
        // tungstenite answers pings and close frames on its own
        WsMessage::Ping(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {}
    }
}
