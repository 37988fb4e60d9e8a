//! WebSocket transport task.
//!
//! The connection runs in a dedicated tokio task. External code communicates
//! with it through a typed command channel and receives server events over a
//! notification channel; the connected flag is published on a `watch` channel
//! so callers can fail over to REST without asking the task.
//!
//! The task owns the reconnect policy: on disconnect or connect failure it
//! retries with capped exponential backoff. Commands arriving while
//! disconnected are dropped (senders are expected to have taken the REST
//! path after checking [`SocketHandle::is_connected`]), so stale emits never
//! replay onto a fresh connection.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use carelink_shared::protocol::{ClientEvent, MarkReadPayload, ServerEvent};
use carelink_shared::{ChatError, ChatId, Result};

use crate::backoff;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands sent *into* the socket task.
#[derive(Debug)]
pub enum SocketCommand {
    /// Send a named event to the server.
    Emit(ClientEvent),
    /// Close the connection and stop the task.
    Shutdown,
}

/// Notifications sent *from* the socket task to the session.
#[derive(Debug, Clone)]
pub enum SocketNotification {
    /// Connection (re)established.
    Connected,
    /// Connection lost or a connect attempt failed.
    Disconnected { reason: String },
    /// A server event arrived.
    Event(ServerEvent),
}

/// Configuration for spawning the socket task.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket endpoint of the messaging backend.
    pub url: Url,
    /// Bearer token supplied by the authenticated session.
    pub auth_token: String,
}

/// Cloneable handle to the socket task.
///
/// All clones share the single underlying connection, which is what makes
/// `connect` idempotent at the session level: there is one task per session,
/// spawned once.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    cmd_tx: mpsc::Sender<SocketCommand>,
    connected: watch::Receiver<bool>,
}

impl SocketHandle {
    /// Build a handle around raw channel parts.
    ///
    /// Lets tests and tools stub the transport: commands land on the given
    /// receiver instead of a live connection.
    pub fn from_parts(
        cmd_tx: mpsc::Sender<SocketCommand>,
        connected: watch::Receiver<bool>,
    ) -> Self {
        Self { cmd_tx, connected }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch receiver for the connected flag (for online/offline indicators).
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Queue an event for the server.
    pub async fn emit(&self, event: ClientEvent) -> Result<()> {
        self.cmd_tx
            .send(SocketCommand::Emit(event))
            .await
            .map_err(|_| ChatError::Transport("Socket task stopped".into()))
    }

    pub async fn join(&self, chat_id: ChatId) -> Result<()> {
        self.emit(ClientEvent::JoinChat(chat_id)).await
    }

    pub async fn leave(&self, chat_id: ChatId) -> Result<()> {
        self.emit(ClientEvent::LeaveChat(chat_id)).await
    }

    pub async fn mark_read(&self, chat_id: ChatId) -> Result<()> {
        self.emit(ClientEvent::MarkRead(MarkReadPayload { chat_id }))
            .await
    }

    /// Stop the task. Idempotent; subsequent commands fail with a transport
    /// error.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SocketCommand::Shutdown).await;
    }
}

/// Spawn the socket task.
///
/// Returns the command handle and the notification receiver.
pub fn spawn_socket(config: SocketConfig) -> (SocketHandle, mpsc::Receiver<SocketNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SocketCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SocketNotification>(256);
    let (connected_tx, connected_rx) = watch::channel(false);

    tokio::spawn(run_socket(config, cmd_rx, notif_tx, connected_tx));

    (
        SocketHandle {
            cmd_tx,
            connected: connected_rx,
        },
        notif_rx,
    )
}

enum LoopExit {
    Shutdown,
    Closed(String),
}

async fn run_socket(
    config: SocketConfig,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    notif_tx: mpsc::Sender<SocketNotification>,
    connected_tx: watch::Sender<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        // http::Request is not Clone; rebuild per attempt.
        let request = match build_request(&config) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Invalid socket configuration");
                let _ = notif_tx
                    .send(SocketNotification::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        match connect_async(request).await {
            Ok((mut ws, _response)) => {
                // Commands queued while the handshake was in flight predate
                // the connection; their senders saw a false connected flag
                // and took the REST path.
                if drain_stale(&mut cmd_rx) {
                    let _ = ws.close(None).await;
                    break;
                }
                attempt = 0;
                let _ = connected_tx.send(true);
                info!(url = %config.url, "Socket connected");
                let _ = notif_tx.send(SocketNotification::Connected).await;

                let exit = connection_loop(&mut ws, &mut cmd_rx, &notif_tx).await;
                let _ = connected_tx.send(false);

                match exit {
                    LoopExit::Shutdown => break,
                    LoopExit::Closed(reason) => {
                        warn!(reason = %reason, "Socket disconnected");
                        let _ = notif_tx
                            .send(SocketNotification::Disconnected { reason })
                            .await;
                    }
                }
            }
            Err(e) => {
                let _ = connected_tx.send(false);
                warn!(error = %e, attempt, "Socket connect failed");
                let _ = notif_tx
                    .send(SocketNotification::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
            }
        }

        if wait_backoff(attempt, &mut cmd_rx).await {
            break;
        }
        attempt += 1;
    }

    info!("Socket task terminated");
}

/// Pump commands and frames over one live connection.
async fn connection_loop(
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<SocketCommand>,
    notif_tx: &mpsc::Sender<SocketNotification>,
) -> LoopExit {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Emit(event)) => {
                        let frame = match event.to_frame() {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(event = event.event_name(), error = %e, "Failed to encode event");
                                continue;
                            }
                        };
                        debug!(event = event.event_name(), "Emitting event");
                        if let Err(e) = ws.send(WsMessage::Text(frame)).await {
                            return LoopExit::Closed(e.to_string());
                        }
                    }
                    Some(SocketCommand::Shutdown) | None => {
                        let _ = ws.close(None).await;
                        return LoopExit::Shutdown;
                    }
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_frame(&text) {
                        Ok(Some(event)) => {
                            let _ = notif_tx.send(SocketNotification::Event(event)).await;
                        }
                        Ok(None) => debug!("Ignoring unknown server event"),
                        Err(e) => warn!(error = %e, "Undecodable frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return LoopExit::Closed("Closed by server".into());
                    }
                    Some(Ok(_)) => {} // binary/pong frames carry nothing for us
                    Some(Err(e)) => return LoopExit::Closed(e.to_string()),
                }
            }
        }
    }
}

/// Drop every command already queued, keeping only a shutdown request.
/// Returns `true` when a shutdown was queued.
fn drain_stale(cmd_rx: &mut mpsc::Receiver<SocketCommand>) -> bool {
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            SocketCommand::Emit(event) => {
                debug!(event = event.event_name(), "Dropping emit queued before connect");
            }
            SocketCommand::Shutdown => return true,
        }
    }
    false
}

/// Sleep out the backoff window while draining commands, so a shutdown is
/// honored promptly and stale emits are not queued for the next connection.
async fn wait_backoff(attempt: u32, cmd_rx: &mut mpsc::Receiver<SocketCommand>) -> bool {
    let sleep = backoff::sleep(attempt);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Emit(event)) => {
                        debug!(event = event.event_name(), "Dropping emit while disconnected");
                    }
                    Some(SocketCommand::Shutdown) | None => return true,
                }
            }
        }
    }
}

fn build_request(config: &SocketConfig) -> Result<Request> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ChatError::Transport(e.to_string()))?;
    let value = HeaderValue::from_str(&format!("Bearer {}", config.auth_token))
        .map_err(|e| ChatError::Transport(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_server_reports_disconnected_and_honors_shutdown() {
        let config = SocketConfig {
            // Port 9 (discard) is not listening in the test environment.
            url: Url::parse("ws://127.0.0.1:9/socket").unwrap(),
            auth_token: "token".into(),
        };
        let (handle, mut notif_rx) = spawn_socket(config);

        assert!(!handle.is_connected());

        match notif_rx.recv().await {
            Some(SocketNotification::Disconnected { .. }) => {}
            other => panic!("Expected Disconnected, got {other:?}"),
        }

        handle.shutdown().await;
        // After shutdown the task stops and further emits fail.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = handle
            .emit(ClientEvent::JoinChat(ChatId::durable("C1")))
            .await;
        assert!(matches!(err, Err(ChatError::Transport(_))));
    }

    #[tokio::test]
    async fn pre_connect_emits_are_discarded_but_shutdown_survives() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(SocketCommand::Emit(ClientEvent::JoinChat(ChatId::durable("C1"))))
            .unwrap();
        tx.try_send(SocketCommand::Emit(ClientEvent::LeaveChat(ChatId::durable("C1"))))
            .unwrap();
        assert!(!drain_stale(&mut rx));
        assert!(rx.try_recv().is_err());

        tx.try_send(SocketCommand::Emit(ClientEvent::JoinChat(ChatId::durable("C2"))))
            .unwrap();
        tx.try_send(SocketCommand::Shutdown).unwrap();
        assert!(drain_stale(&mut rx));
    }

    #[test]
    fn request_carries_bearer_token() {
        let config = SocketConfig {
            url: Url::parse("wss://chat.example.com/socket").unwrap(),
            auth_token: "abc123".into(),
        };
        let request = build_request(&config).unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer abc123"
        );
    }
}
