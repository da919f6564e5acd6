//! Ordered, deduplicated ephemeral chat log.
//!
//! History is sorted by `(sent_at, id)` so every client that holds the
//! same set of messages renders the same sequence. New arrivals are
//! insertion-sorted from the tail, which is where nearly all of them land.
//!
//! Outbound messages live in one of two places until the server echoes
//! them back:
//! - `unacked`: sent on an open transport, echo not yet seen
//! - `queue`: composed while offline, bounded FIFO
//!
//! Both are retransmitted in order after a reconnect; receivers drop the
//! duplicates by id.

use std::collections::{HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::protocol::{ChatMessage, ClientId};

/// What happened to a locally composed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Transmit now.
    Send,
    /// Held until the transport reopens.
    Queued,
    /// Retry queue full; the message stays in local history only.
    Dropped,
}

/// Effect of an inbound chat frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    Appended(ChatMessage),
    /// Server echo of one of our messages; moved to its authoritative slot.
    Restamped(ChatMessage),
    Duplicate,
}

pub struct ChatChannel {
    local_client_id: ClientId,
    history: Vec<ChatMessage>,
    ids: HashSet<String>,
    unacked: VecDeque<ChatMessage>,
    queue: VecDeque<ChatMessage>,
    capacity: usize,
}

impl ChatChannel {
    pub fn new(local_client_id: ClientId, capacity: usize) -> Self {
        Self {
            local_client_id,
            history: Vec::new(),
            ids: HashSet::new(),
            unacked: VecDeque::new(),
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Compose a message and append it optimistically.
    ///
    /// Empty or whitespace-only text is rejected with no state change.
    pub fn send(&mut self, text: &str, online: bool, now_ms: u64) -> Option<(ChatMessage, Delivery)> {
        if text.trim().is_empty() {
            return None;
        }

        let message = ChatMessage {
            id: format!("{now_ms:013}-{}", Uuid::new_v4().simple()),
            author_client_id: self.local_client_id.clone(),
            text: text.to_string(),
            sent_at: now_ms,
        };
        self.insert_sorted(message.clone());

        let delivery = if online {
            self.track_unacked(message.clone());
            Delivery::Send
        } else if self.queue.len() < self.capacity {
            self.queue.push_back(message.clone());
            Delivery::Queued
        } else {
            log::warn!("Chat retry queue full ({}), message {} not queued", self.capacity, message.id);
            Delivery::Dropped
        };

        Some((message, delivery))
    }

    /// Apply an inbound chat frame.
    pub fn on_remote(&mut self, message: ChatMessage) -> ChatUpdate {
        if !self.ids.contains(&message.id) {
            self.insert_sorted(message.clone());
            return ChatUpdate::Appended(message);
        }

        let Some(pending) = self.unacked.iter().position(|m| m.id == message.id) else {
            return ChatUpdate::Duplicate;
        };
        self.unacked.remove(pending);

        let Some(index) = self.history.iter().position(|m| m.id == message.id) else {
            return ChatUpdate::Duplicate;
        };
        if self.history[index].sent_at == message.sent_at {
            return ChatUpdate::Duplicate;
        }
        let mut restamped = self.history.remove(index);
        restamped.sent_at = message.sent_at;
        self.ids.remove(&restamped.id);
        self.insert_sorted(restamped.clone());
        ChatUpdate::Restamped(restamped)
    }

    /// Everything that must be (re)transmitted after a reconnect, in send order.
    ///
    /// Returned messages are tracked as unacknowledged again, within the
    /// same bound as live sends.
    pub fn take_retry(&mut self) -> Vec<ChatMessage> {
        let mut retry: Vec<ChatMessage> = self.unacked.drain(..).collect();
        retry.extend(self.queue.drain(..));
        for message in &retry {
            self.track_unacked(message.clone());
        }
        retry
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    fn track_unacked(&mut self, message: ChatMessage) {
        if self.unacked.len() >= self.capacity {
            if let Some(oldest) = self.unacked.pop_front() {
                log::warn!("Giving up on acknowledgement for chat message {}", oldest.id);
            }
        }
        self.unacked.push_back(message);
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        let mut index = self.history.len();
        while index > 0 && self.history[index - 1].order_key() > message.order_key() {
            index -= 1;
        }
        self.ids.insert(message.id.clone());
        self.history.insert(index, message);
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
