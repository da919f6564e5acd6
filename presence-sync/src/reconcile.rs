//! Reconciliation of local state against the snapshot sent on (re)join.
//!
//! Incremental frames cannot repair a gap: anything broadcast while we
//! were disconnected is simply gone. So every successful connection starts
//! from the server's full snapshot, applied all-or-nothing:
//!
//! 1. registry ← snapshot collaborators (diffed, so removals and additions
//!    are both observable)
//! 2. cursors ← snapshot cursors
//! 3. follow mode dropped if its target vanished
//! 4. chat retry queue drained in FIFO order

use std::time::Instant;

use thiserror::Error;

use crate::chat::ChatChannel;
use crate::cursor::CursorTracker;
use crate::follow::{FollowController, FollowEvent};
use crate::presence::{PresenceEvent, PresenceRegistry};
use crate::protocol::{ChatMessage, ClientId, CursorState, SessionSnapshot};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Everything a reconciliation changed.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub presence: Vec<PresenceEvent>,
    pub cursors: Vec<(ClientId, CursorState)>,
    pub follow: Option<FollowEvent>,
    /// Chat messages to transmit, oldest first.
    pub chat_retry: Vec<ChatMessage>,
}

/// Apply `snapshot` to the session components.
///
/// The snapshot is validated before anything is touched; an invalid one
/// leaves every component exactly as it was.
pub fn apply_snapshot(
    snapshot: SessionSnapshot,
    local_client_id: &ClientId,
    registry: &mut PresenceRegistry,
    tracker: &mut CursorTracker,
    follow: &mut FollowController,
    chat: &mut ChatChannel,
    now: Instant,
) -> Result<ReconcileOutcome, ReconcileError> {
    snapshot.validate().map_err(ReconcileError::InvalidSnapshot)?;

    let mut infos = Vec::with_capacity(snapshot.collaborators.len());
    let mut cursors = Vec::new();
    for entry in snapshot.collaborators {
        if &entry.client_id == local_client_id {
            continue;
        }
        infos.push(entry.info());
        if let Some(cursor) = entry.cursor {
            cursors.push((entry.client_id, cursor));
        }
    }

    let presence = registry.replace_all(infos, now);
    tracker.replace_all(cursors.clone());
    let follow = follow.ensure_present(registry);
    let chat_retry = chat.take_retry();

    log::info!(
        "Reconciled with snapshot: {} collaborators, {} presence changes, {} chat retries",
        registry.len(),
        presence.len(),
        chat_retry.len()
    );

    Ok(ReconcileOutcome {
        presence,
        cursors,
        follow,
        chat_retry,
    })
}
