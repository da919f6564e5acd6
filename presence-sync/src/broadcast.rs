//! Per-session rooms with fan-out to every member.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! messages; a slow member lags and loses frames instead of stalling the
//! room. Origin filtering is left to the receiving connection.
//!
//! Besides fan-out a room keeps what a joining client needs for its
//! snapshot: the members in join order and their latest cursors.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::protocol::{
    ClientId, CollaboratorInfo, CursorState, EncodeError, Frame, PresenceUpdate, SessionSnapshot,
    SnapshotEntry,
};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Atomic broadcast stats, so the send path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// One relayed frame.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub origin: ClientId,
    /// Deliver to the origin's own connection too (chat acknowledgement).
    pub include_origin: bool,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomMessage {
    /// Whether the connection of `client_id` should forward this message.
    pub fn is_for(&self, client_id: Option<&ClientId>) -> bool {
        self.include_origin || client_id != Some(&self.origin)
    }
}

#[derive(Debug, Error)]
#[error("room is full ({0} members)")]
pub struct RoomFull(pub usize);

/// Proof of membership handed to the connection that joined.
///
/// A client that reconnects before its old socket is noticed as dead joins
/// again under the same id; only the newest membership may remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipToken(u64);

#[derive(Debug, Clone)]
struct Member {
    info: CollaboratorInfo,
    cursor: Option<CursorState>,
    token: MembershipToken,
}

/// A broadcast group for a single session room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomMessage>,
    members: RwLock<IndexMap<ClientId, Member>>,
    /// First server stamp of every recently seen chat id.
    chat_stamps: Mutex<LruCache<String, u64>>,
    capacity: usize,
    max_members: usize,
    next_token: AtomicU64,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group buffering `capacity` messages per member.
    pub fn new(capacity: usize, max_members: usize, chat_memory: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let chat_memory = NonZeroUsize::new(chat_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            sender,
            members: RwLock::new(IndexMap::new()),
            chat_stamps: Mutex::new(LruCache::new(chat_memory)),
            capacity,
            max_members,
            next_token: AtomicU64::new(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add (or re-add) a member and subscribe it to the room.
    ///
    /// A rejoin under an existing client id keeps its slot and cursor.
    pub async fn add_member(
        &self,
        info: CollaboratorInfo,
    ) -> Result<(broadcast::Receiver<RoomMessage>, MembershipToken), RoomFull> {
        let mut members = self.members.write().await;
        let token = MembershipToken(self.next_token.fetch_add(1, Ordering::Relaxed));

        match members.get_mut(&info.client_id) {
            Some(existing) => {
                existing.info = info;
                existing.token = token;
            }
            None => {
                if members.len() >= self.max_members {
                    return Err(RoomFull(self.max_members));
                }
                members.insert(
                    info.client_id.clone(),
                    Member {
                        info,
                        cursor: None,
                        token,
                    },
                );
            }
        }
        Ok((self.sender.subscribe(), token))
    }

    /// Remove a member if `token` is still its current membership.
    pub async fn remove_member(
        &self,
        client_id: &ClientId,
        token: MembershipToken,
    ) -> Option<CollaboratorInfo> {
        let mut members = self.members.write().await;
        match members.get(client_id) {
            Some(member) if member.token == token => {
                members.shift_remove(client_id).map(|m| m.info)
            }
            _ => None,
        }
    }

    /// Refresh a member's metadata. `false` for unknown members.
    pub async fn update_presence(&self, update: &PresenceUpdate) -> bool {
        let mut members = self.members.write().await;
        match members.get_mut(&update.client_id) {
            Some(member) => {
                member.info = update.info();
                true
            }
            None => false,
        }
    }

    /// Store a member's cursor for later snapshots.
    ///
    /// Returns `false` for unknown members and for out-of-order frames.
    pub async fn update_cursor(&self, client_id: &ClientId, cursor: CursorState) -> bool {
        let mut members = self.members.write().await;
        let Some(member) = members.get_mut(client_id) else {
            return false;
        };
        if let Some(current) = &member.cursor {
            if cursor.seq < current.seq {
                return false;
            }
        }
        member.cursor = Some(cursor);
        true
    }

    /// Everyone except `exclude`, with their cursors, in join order.
    pub async fn snapshot(&self, exclude: &ClientId, server_time: u64) -> SessionSnapshot {
        let members = self.members.read().await;
        let collaborators = members
            .values()
            .filter(|m| &m.info.client_id != exclude)
            .map(|m| SnapshotEntry {
                client_id: m.info.client_id.clone(),
                user_id: m.info.user_id.clone(),
                display_name: m.info.display_name.clone(),
                color: m.info.color.clone(),
                cursor: m.cursor.clone(),
            })
            .collect();
        SessionSnapshot {
            collaborators,
            server_time,
        }
    }

    /// Authoritative `sentAt` for a chat id.
    ///
    /// The first stamp is reused for redeliveries so every copy of a
    /// message sorts identically.
    pub async fn stamp_chat(&self, id: &str, now_ms: u64) -> u64 {
        let mut stamps = self.chat_stamps.lock().await;
        if let Some(stamp) = stamps.get(id) {
            return *stamp;
        }
        stamps.put(id.to_string(), now_ms);
        now_ms
    }

    /// Encode and broadcast a frame.
    ///
    /// Returns the number of receivers that got the message.
    pub fn broadcast(
        &self,
        origin: &ClientId,
        include_origin: bool,
        frame: &Frame,
    ) -> Result<usize, EncodeError> {
        let bytes = Arc::new(frame.encode()?);
        Ok(self.broadcast_raw(RoomMessage {
            origin: origin.clone(),
            include_origin,
            bytes,
        }))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, message: RoomMessage) -> usize {
        match self.sender.send(message) {
            Ok(count) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<CollaboratorInfo> {
        self.members.read().await.values().map(|m| m.info.clone()).collect()
    }

    pub async fn has_member(&self, client_id: &ClientId) -> bool {
        self.members.read().await.contains_key(client_id)
    }

    pub async fn cursor(&self, client_id: &ClientId) -> Option<CursorState> {
        self.members
            .read()
            .await
            .get(client_id)
            .and_then(|m| m.cursor.clone())
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.sender.subscribe()
    }
}

/// Maps session keys to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_members: usize,
    chat_memory: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_members: usize, chat_memory: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_members,
            chat_memory,
        }
    }

    /// Get or create the room for `session_key`.
    pub async fn get_or_create(&self, session_key: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session_key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(room) = rooms.get(session_key) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(
            self.capacity,
            self.max_members,
            self.chat_memory,
        ));
        rooms.insert(session_key.to_string(), room.clone());
        log::debug!("Room {session_key} created");
        room
    }

    pub async fn get(&self, session_key: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(session_key).cloned()
    }

    /// Remove the room if nobody is left in it.
    pub async fn remove_if_empty(&self, session_key: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_key) {
            if room.member_count().await == 0 {
                rooms.remove(session_key);
                log::info!("Room {session_key} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
