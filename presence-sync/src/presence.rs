//! Presence registry: who is currently joined and how recently they spoke.
//!
//! ## Architecture
//!
//! ```text
//! join / presence-update ──► upsert()  ──┐
//! cursor / chat          ──► touch()   ──┤
//! leave                  ──► remove()  ──┼──► IndexMap<ClientId, Collaborator>
//! snapshot               ──► replace_all()│        (first-join order)
//! 5s timer               ──► tick()    ──┘
//!                                              │
//!                                              ▼
//!                                       PresenceEvent stream
//! ```
//!
//! Status is never transmitted. It is derived from the silence since
//! the last frame a collaborator sent:
//!
//! | Silence | Status |
//! |---------|--------|
//! | < 30s | active |
//! | < 120s | idle |
//! | >= 120s | offline |
//! | >= 180s | removed |

use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::config::SessionConfig;
use crate::protocol::{ClientId, CollaboratorInfo, PresenceUpdate};

/// Coarse liveness of a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceStatus {
    Active,
    Idle,
    Offline,
}

/// One remote participant as seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub client_id: ClientId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    /// Document the collaborator last announced as open.
    pub active_document_id: Option<String>,
    pub status: PresenceStatus,
    /// Instant the last frame from this client was received.
    pub last_seen_at: Instant,
}

impl Collaborator {
    pub fn from_info(info: CollaboratorInfo, now: Instant) -> Self {
        Self {
            client_id: info.client_id,
            user_id: info.user_id,
            display_name: info.display_name,
            color: info.color,
            active_document_id: None,
            status: PresenceStatus::Active,
            last_seen_at: now,
        }
    }

    pub fn info(&self) -> CollaboratorInfo {
        CollaboratorInfo {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }

    fn same_identity(&self, info: &CollaboratorInfo) -> bool {
        self.user_id == info.user_id
            && self.display_name == info.display_name
            && self.color == info.color
    }
}

/// Why a collaborator disappeared from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Explicit `leave` frame
    Leave,
    /// Silent past the offline grace period
    Timeout,
    /// Absent from the snapshot applied on reconnect
    Reconciled,
}

/// Observable registry change.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined(Collaborator),
    Updated(Collaborator),
    StatusChanged {
        client_id: ClientId,
        status: PresenceStatus,
    },
    Left {
        client_id: ClientId,
        reason: LeaveReason,
    },
}

/// Authoritative local view of the joined collaborators.
pub struct PresenceRegistry {
    entries: IndexMap<ClientId, Collaborator>,
    active_threshold: Duration,
    idle_threshold: Duration,
    eviction_after: Duration,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl PresenceRegistry {
    pub fn new(active_threshold: Duration, idle_threshold: Duration, offline_grace: Duration) -> Self {
        Self::from_config(&SessionConfig {
            active_threshold,
            idle_threshold,
            offline_grace,
            ..SessionConfig::default()
        })
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            entries: IndexMap::new(),
            active_threshold: config.active_threshold,
            idle_threshold: config.idle_threshold,
            eviction_after: config.eviction_after(),
        }
    }

    /// Status for a given amount of silence.
    pub fn status_for(&self, silence: Duration) -> PresenceStatus {
        if silence < self.active_threshold {
            PresenceStatus::Active
        } else if silence < self.idle_threshold {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Offline
        }
    }

    /// Insert or refresh a collaborator.
    ///
    /// Idempotent: applying the same update twice yields the same state
    /// and no events the second time.
    pub fn upsert(&mut self, update: &PresenceUpdate, now: Instant) -> Vec<PresenceEvent> {
        let info = update.info();
        let mut events = Vec::new();

        match self.entries.get_mut(&update.client_id) {
            Some(existing) => {
                let changed = !existing.same_identity(&info)
                    || (update.active_document_id.is_some()
                        && existing.active_document_id != update.active_document_id);
                if changed {
                    existing.user_id = info.user_id;
                    existing.display_name = info.display_name;
                    existing.color = info.color;
                    if update.active_document_id.is_some() {
                        existing.active_document_id = update.active_document_id.clone();
                    }
                    events.push(PresenceEvent::Updated(existing.clone()));
                }
                events.extend(self.touch(&update.client_id, now));
            }
            None => {
                let mut collaborator = Collaborator::from_info(info, now);
                collaborator.active_document_id = update.active_document_id.clone();
                log::debug!(
                    "Presence: {} ({}) joined",
                    collaborator.display_name,
                    collaborator.client_id
                );
                events.push(PresenceEvent::Joined(collaborator.clone()));
                self.entries.insert(update.client_id.clone(), collaborator);
            }
        }

        events
    }

    /// Record activity from a known collaborator.
    ///
    /// Returns a status event when the collaborator flips back to active.
    pub fn touch(&mut self, client_id: &ClientId, now: Instant) -> Option<PresenceEvent> {
        let entry = self.entries.get_mut(client_id)?;
        if now > entry.last_seen_at {
            entry.last_seen_at = now;
        }
        if entry.status != PresenceStatus::Active {
            entry.status = PresenceStatus::Active;
            return Some(PresenceEvent::StatusChanged {
                client_id: client_id.clone(),
                status: PresenceStatus::Active,
            });
        }
        None
    }

    /// Remove a collaborator, keeping the order of the others.
    pub fn remove(&mut self, client_id: &ClientId, reason: LeaveReason) -> Option<PresenceEvent> {
        self.entries.shift_remove(client_id).map(|c| {
            log::debug!("Presence: {} left ({reason:?})", c.client_id);
            PresenceEvent::Left {
                client_id: c.client_id,
                reason,
            }
        })
    }

    /// Recompute every status and evict collaborators silent past the grace period.
    pub fn tick(&mut self, now: Instant) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        let mut evicted = Vec::new();

        for (client_id, entry) in self.entries.iter_mut() {
            let silence = now.saturating_duration_since(entry.last_seen_at);
            if silence >= self.eviction_after {
                evicted.push(client_id.clone());
                continue;
            }
            let status = if silence < self.active_threshold {
                PresenceStatus::Active
            } else if silence < self.idle_threshold {
                PresenceStatus::Idle
            } else {
                PresenceStatus::Offline
            };
            if status != entry.status {
                entry.status = status;
                events.push(PresenceEvent::StatusChanged {
                    client_id: client_id.clone(),
                    status,
                });
            }
        }

        for client_id in evicted {
            events.extend(self.remove(&client_id, LeaveReason::Timeout));
        }
        events
    }

    /// Replace the whole registry with an authoritative set.
    ///
    /// Survivors keep their display position; newcomers are appended in
    /// the order given. Removals, additions and metadata changes are all
    /// reported.
    pub fn replace_all(&mut self, infos: Vec<CollaboratorInfo>, now: Instant) -> Vec<PresenceEvent> {
        let mut events = Vec::new();

        let stale: Vec<ClientId> = self
            .entries
            .keys()
            .filter(|id| !infos.iter().any(|info| &info.client_id == *id))
            .cloned()
            .collect();
        for client_id in stale {
            events.extend(self.remove(&client_id, LeaveReason::Reconciled));
        }

        for info in infos {
            match self.entries.get_mut(&info.client_id) {
                Some(existing) => {
                    let changed = !existing.same_identity(&info);
                    existing.user_id = info.user_id;
                    existing.display_name = info.display_name;
                    existing.color = info.color;
                    existing.last_seen_at = now;
                    existing.status = PresenceStatus::Active;
                    if changed {
                        events.push(PresenceEvent::Updated(existing.clone()));
                    }
                }
                None => {
                    let collaborator = Collaborator::from_info(info, now);
                    events.push(PresenceEvent::Joined(collaborator.clone()));
                    self.entries.insert(collaborator.client_id.clone(), collaborator);
                }
            }
        }

        events
    }

    /// All live collaborators in first-join order.
    pub fn list_active(&self) -> Vec<Collaborator> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&Collaborator> {
        self.entries.get(client_id)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.entries.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Color assignment
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color for a user id.
///
/// The hue comes from an FNV-1a hash of the id so every client picks
/// the same color for the same user.
pub fn assign_color(user_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
