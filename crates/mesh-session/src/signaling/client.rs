//! WebSocket signaling client
//!
//! One control-plane socket per session. Outbound messages are queued to a
//! sender task; inbound messages are parsed by a receiver task and delivered,
//! in arrival order, on the event channel returned by [`SignalingClient::connect`].

use super::protocol::{ClientMessage, ServerMessage};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Events delivered from the signaling socket
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A well-formed inbound message
    Message(ServerMessage),

    /// The socket closed or failed without a local close
    Lost(String),
}

/// Handle to the signaling socket
///
/// Cloning is cheap; all clones share the same socket.
#[derive(Clone)]
pub struct SignalingClient {
    /// Outgoing message sender
    tx: mpsc::UnboundedSender<Message>,

    /// Set once `close` has been called; suppresses the `Lost` event
    closing: Arc<AtomicBool>,

    keepalive: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Build the room URL: `<base>?roomId=<room>&token=<token>`
pub fn room_url(base: &str, room_id: &str, token: &str) -> Result<String> {
    let mut url = url::Url::parse(base)
        .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL {}: {}", base, e)))?;
    url.query_pairs_mut()
        .append_pair("roomId", room_id)
        .append_pair("token", token);
    Ok(url.to_string())
}

impl SignalingClient {
    /// Connect to the signaling server and join `room_id`
    ///
    /// Starts the sender, receiver and keepalive tasks. The keepalive sends
    /// `{"type":"ping"}` every `keepalive` interval until the client is closed.
    pub async fn connect(
        base_url: &str,
        room_id: &str,
        token: &str,
        keepalive: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let url = room_url(base_url, room_id, token)?;
        info!("Connecting to signaling server: {} (room {})", base_url, room_id);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, events_tx, Arc::clone(&closing)));
        let keepalive_task = tokio::spawn(Self::keepalive_task(tx.clone(), keepalive));

        let client = Self {
            tx,
            closing,
            keepalive: Arc::new(Mutex::new(Some(keepalive_task))),
        };

        Ok((client, events_rx))
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: parses inbound frames and forwards them in order
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<SignalingEvent>,
        closing: Arc<AtomicBool>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                    Ok(msg) => {
                        debug!("Received signaling message: {}", msg.name());
                        if events.send(SignalingEvent::Message(msg)).is_err() {
                            debug!("Signaling event receiver dropped");
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Dropping signaling message: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket connection closed");
                    break "connection closed by server".to_string();
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break format!("WebSocket error: {}", e);
                }
                None => break "connection ended".to_string(),
                Some(Ok(_)) => {}
            }
        };

        if !closing.load(Ordering::SeqCst) {
            warn!("Signaling socket lost: {}", reason);
            let _ = events.send(SignalingEvent::Lost(reason));
        }

        debug!("Receiver task terminated");
    }

    async fn keepalive_task(tx: mpsc::UnboundedSender<Message>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let json = match ClientMessage::Ping.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode keepalive: {}", e);
                    break;
                }
            };
            if tx.send(Message::Text(json)).is_err() {
                break;
            }
        }

        debug!("Keepalive task terminated");
    }

    /// Queue a message for the server (fire-and-forget)
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        let json = msg.to_json()?;
        debug!("Sending signaling message: {}", json);

        self.tx
            .send(Message::Text(json))
            .map_err(|e| Error::SignalingError(format!("Failed to send message: {}", e)))
    }

    /// Close the socket
    ///
    /// Messages queued before this call are still flushed ahead of the close frame.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }

        let _ = self.tx.send(Message::Close(None));
        info!("Signaling socket closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}
