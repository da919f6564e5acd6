//! WebSocket relay with room-based session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<sessionKey>
//!             ├── Room (sessionKey) ── BroadcastGroup
//! Client B ──┘        │                  (members, cursors, chat stamps)
//!                     │
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! Per connection:
//! - `join` → reply with a `snapshot` of the other members, broadcast a
//!   `presence-update` to them
//! - `presence-update`, `cursor` → stored and relayed to the others
//! - `chat` → stamped with the server clock and relayed to everyone,
//!   author included (that copy is the acknowledgement)
//! - `leave` → member removed, `leave` relayed
//! - disconnect → member removed without a `leave`; peers keep showing it
//!   until it rejoins or their offline grace runs out
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, MembershipToken, RoomManager, RoomMessage};
use crate::chat::unix_millis;
use crate::config::ServerConfig;
use crate::protocol::{ClientId, Frame};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct PresenceServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PresenceServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
            config.chat_id_memory,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Presence relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await?;
        let session_key = path.trim_matches('/').to_string();
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        if session_key.is_empty() {
            log::warn!("Connection from {addr} without a session key, closing");
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        }
        log::info!("WebSocket connection established from {addr} for session {session_key}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<(ClientId, MembershipToken, Arc<BroadcastGroup>)> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<RoomMessage>> = None;
        let mut departed = false;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.to_vec(),
                            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                stats.write().await.rejected_frames += 1;
                                continue;
                            }
                        };

                        let Some((client_id, _, room)) = &joined else {
                            match frame {
                                Frame::Join(info) => {
                                    let room = rooms.get_or_create(&session_key).await;
                                    let (rx, token) = match room.add_member(info.clone()).await {
                                        Ok(membership) => membership,
                                        Err(e) => {
                                            log::warn!("{} refused in {session_key}: {e}", info.client_id);
                                            break;
                                        }
                                    };
                                    broadcast_rx = Some(rx);

                                    let snapshot = room.snapshot(&info.client_id, unix_millis()).await;
                                    let encoded = Frame::snapshot(snapshot).encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;

                                    let announce = Frame::presence_update(&info, None);
                                    room.broadcast(&info.client_id, false, &announce)?;

                                    log::info!(
                                        "{} ({}) joined session {session_key}",
                                        info.display_name,
                                        info.client_id
                                    );
                                    stats.write().await.active_rooms = rooms.room_count().await;
                                    joined = Some((info.client_id, token, room));
                                }
                                other => {
                                    log::debug!("Ignoring {} frame before join from {addr}", other.kind());
                                }
                            }
                            continue;
                        };

                        if frame.origin().is_some_and(|origin| origin != client_id) {
                            log::warn!("Dropping {} frame from {addr} with foreign origin", frame.kind());
                            stats.write().await.rejected_frames += 1;
                            continue;
                        }

                        match frame {
                            Frame::PresenceUpdate(update) => {
                                room.update_presence(&update).await;
                                room.broadcast_raw(RoomMessage {
                                    origin: client_id.clone(),
                                    include_origin: false,
                                    bytes: Arc::new(bytes),
                                });
                            }
                            Frame::Cursor(cursor) => {
                                log::trace!("Cursor from {client_id} in {session_key}");
                                if room.update_cursor(client_id, cursor.cursor_state()).await {
                                    room.broadcast_raw(RoomMessage {
                                        origin: client_id.clone(),
                                        include_origin: false,
                                        bytes: Arc::new(bytes),
                                    });
                                }
                            }
                            Frame::Chat(mut message) => {
                                message.sent_at = room.stamp_chat(&message.id, unix_millis()).await;
                                room.broadcast(client_id, true, &Frame::chat(message))?;
                            }
                            Frame::Leave(_) => {
                                log::info!("{client_id} left session {session_key}");
                                departed = true;
                                break;
                            }
                            Frame::Join(_) | Frame::Snapshot(_) => {
                                log::debug!("Ignoring unexpected {} frame from {addr}", frame.kind());
                            }
                        }
                    }

                    msg = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(message) => {
                                let own_id = joined.as_ref().map(|(id, _, _)| id);
                                if !message.is_for(own_id) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(message.bytes.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {addr} lagged by {n} messages");
                                if let Some((_, _, room)) = &joined {
                                    room.record_lag(n);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Only an explicit leave is relayed. A dropped socket may be a blip,
        // so peers age the member out on their own clock.
        if let Some((client_id, token, room)) = joined {
            if room.remove_member(&client_id, token).await.is_some() {
                if departed {
                    let leave = Frame::leave(client_id.clone());
                    if let Err(e) = room.broadcast(&client_id, false, &leave) {
                        log::error!("Failed to announce departure of {client_id}: {e}");
                    }
                } else {
                    log::info!("{client_id} disconnected from {session_key} without leaving");
                }
            }
        }
        rooms.remove_if_empty(&session_key).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
