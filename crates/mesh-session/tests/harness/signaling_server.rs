//! Embedded WebSocket signaling server for mesh E2E testing
//!
//! Implements the room protocol: `joined` on connect, `peer_joined` and
//! `peer_left` to the rest of the room, and relay of `offer`, `answer` and
//! `candidate` with `to` rewritten to `from`. The `token` query parameter is
//! used as the participant id.

use super::{HarnessError, HarnessResult};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

struct Member {
    id: String,
    tx: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct ServerState {
    rooms: Mutex<HashMap<String, Vec<Member>>>,
    pings: AtomicUsize,
    leaves: Mutex<Vec<String>>,
    relayed: Mutex<Vec<(String, String)>>,
    /// Relays queued while held, as (room, to, message)
    held: Mutex<Option<Vec<(String, String, Value)>>>,
}

impl ServerState {
    fn send_to(&self, room: &str, to: &str, msg: Value) -> bool {
        let rooms = self.rooms.lock();
        let Some(member) = rooms
            .get(room)
            .and_then(|members| members.iter().find(|m| m.id == to))
        else {
            return false;
        };
        member.tx.send(Message::Text(msg.to_string())).is_ok()
    }

    /// Deliver a relayed message, or queue it while relays are held
    fn relay(&self, room: &str, to: &str, msg: Value) -> bool {
        if let Some(queue) = self.held.lock().as_mut() {
            queue.push((room.to_string(), to.to_string(), msg));
            return true;
        }
        self.send_to(room, to, msg)
    }

    fn broadcast(&self, room: &str, except: &str, msg: Value) {
        let rooms = self.rooms.lock();
        for member in rooms.get(room).into_iter().flatten() {
            if member.id != except {
                let _ = member.tx.send(Message::Text(msg.to_string()));
            }
        }
    }

    /// Remove a member; returns whether it was still present
    fn remove(&self, room: &str, id: &str) -> Option<Member> {
        let mut rooms = self.rooms.lock();
        let members = rooms.get_mut(room)?;
        let index = members.iter().position(|m| m.id == id)?;
        Some(members.remove(index))
    }
}

/// Embedded signaling server
pub struct SignalingServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl SignalingServer {
    /// Bind to a random port and start accepting
    pub async fn start() -> HarnessResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| HarnessError::ServerError(format!("Failed to bind: {}", e)))?;
        let addr = listener.local_addr()?;

        let state = Arc::new(ServerState::default());
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Accepted connection from {}", peer);
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Ids currently in `room`, in join order
    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .rooms
            .lock()
            .get(room)
            .map(|members| members.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Participants that sent `leave`
    pub fn leaves(&self) -> Vec<String> {
        self.state.leaves.lock().clone()
    }

    /// Relayed message types with their sender, in relay order
    pub fn relayed(&self) -> Vec<(String, String)> {
        self.state.relayed.lock().clone()
    }

    /// Queue relayed offers, answers and candidates until `release_relays`
    pub fn hold_relays(&self) {
        self.state.held.lock().get_or_insert_with(Vec::new);
    }

    /// Number of relays queued since `hold_relays`
    pub fn held_relays(&self) -> usize {
        self.state.held.lock().as_ref().map_or(0, Vec::len)
    }

    /// Deliver every queued relay in arrival order and stop holding
    pub fn release_relays(&self) {
        let queued = self.state.held.lock().take().unwrap_or_default();
        for (room, to, msg) in queued {
            self.state.send_to(&room, &to, msg);
        }
    }

    /// Send `room_closed` to everyone and close their sockets
    pub fn close_room(&self, room: &str, reason: &str) {
        let members = self.state.rooms.lock().remove(room).unwrap_or_default();
        let msg = json!({ "type": "room_closed", "reason": reason });
        for member in members {
            let _ = member.tx.send(Message::Text(msg.to_string()));
            let _ = member.tx.send(Message::Close(None));
        }
        info!("Closed room {}", room);
    }

    /// Drop a participant's socket without a close handshake
    pub fn drop_participant(&self, room: &str, id: &str) {
        if let Some(member) = self.state.remove(room, id) {
            for task in member.tasks {
                task.abort();
            }
            self.state.broadcast(
                room,
                id,
                json!({ "type": "peer_left", "participantId": id }),
            );
            info!("Dropped participant {}", id);
        }
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
        let rooms: Vec<Member> = self
            .state
            .rooms
            .lock()
            .drain()
            .flat_map(|(_, members)| members)
            .collect();
        for member in rooms {
            for task in member.tasks {
                task.abort();
            }
        }
    }
}

fn query_params(uri: &str) -> HashMap<String, String> {
    url::Url::parse(&format!("ws://localhost{}", uri))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let mut uri = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        uri = req.uri().to_string();
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let params = query_params(&uri);
    let (Some(room), Some(id)) = (params.get("roomId").cloned(), params.get("token").cloned())
    else {
        warn!("Rejecting connection without roomId/token: {}", uri);
        return;
    };

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    let roster: Vec<Value> = {
        let rooms = state.rooms.lock();
        rooms
            .get(&room)
            .into_iter()
            .flatten()
            .map(|m| json!({ "id": m.id }))
            .chain(std::iter::once(json!({ "id": id })))
            .collect()
    };
    let _ = tx.send(Message::Text(
        json!({ "type": "joined", "participantId": id, "participants": roster }).to_string(),
    ));
    state.broadcast(
        &room,
        &id,
        json!({ "type": "peer_joined", "participant": { "id": id, "displayName": id } }),
    );

    let reader_state = Arc::clone(&state);
    let reader_room = room.clone();
    let reader_id = id.clone();
    let reader = tokio::spawn(async move {
        let state = reader_state;
        while let Some(Ok(frame)) = read.next().await {
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(mut msg) = serde_json::from_str::<Value>(&text) else {
                debug!("Ignoring malformed frame from {}", reader_id);
                continue;
            };

            let kind = msg["type"].as_str().unwrap_or_default().to_string();
            match kind.as_str() {
                "ping" => {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                }
                "leave" => {
                    state.leaves.lock().push(reader_id.clone());
                    break;
                }
                "offer" | "answer" | "candidate" => {
                    let Some(obj) = msg.as_object_mut() else {
                        continue;
                    };
                    let Some(to) = obj.remove("to").and_then(|v| v.as_str().map(String::from))
                    else {
                        continue;
                    };
                    obj.insert("from".to_string(), Value::String(reader_id.clone()));
                    state.relayed.lock().push((kind.clone(), reader_id.clone()));
                    if !state.relay(&reader_room, &to, msg) {
                        debug!("Dropping {} from {} to absent {}", kind, reader_id, to);
                    }
                }
                other => debug!("Ignoring {} from {}", other, reader_id),
            }
        }

        if state.remove(&reader_room, &reader_id).is_some() {
            state.broadcast(
                &reader_room,
                &reader_id,
                json!({ "type": "peer_left", "participantId": reader_id }),
            );
            info!("Participant {} left room {}", reader_id, reader_room);
        }
    });

    state.rooms.lock().entry(room).or_default().push(Member {
        id,
        tx,
        tasks: vec![writer, reader],
    });
}
