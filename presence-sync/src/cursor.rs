//! Cursor/selection tracking.
//!
//! ```text
//! local caret move ──► report_local() ──┬──► CursorState (sent now)
//!                                       └──► pending slot ──► flush_due()
//!                                                 (latest only, ≤ 1 per 50ms)
//!
//! remote cursor frame ──► on_remote_update() ──► HashMap<ClientId, CursorState>
//!                           (higher seq wins)
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ClientId, CursorState, Position, Selection};

/// Latest cursor per collaborator plus the local outbound throttle.
pub struct CursorTracker {
    remote: HashMap<ClientId, CursorState>,
    /// Latest local state, stamped with the seq it was (or will be) sent with.
    local: Option<CursorState>,
    /// A local change is waiting for the throttle window to close.
    pending: bool,
    last_sent: Option<Instant>,
    throttle: Duration,
    seq: u64,
}

impl CursorTracker {
    pub fn new(throttle: Duration) -> Self {
        Self {
            remote: HashMap::new(),
            local: None,
            pending: false,
            last_sent: None,
            throttle,
            seq: 0,
        }
    }

    // ── Local side ──────────────────────────────────────────────

    /// Record a local caret/selection change.
    ///
    /// Returns the state to send right away, or `None` when throttled. A
    /// throttled change is not lost: the latest one is released by
    /// [`flush_due`](Self::flush_due) once the window closes.
    pub fn report_local(
        &mut self,
        document_id: impl Into<String>,
        position: Position,
        selection: Option<Selection>,
        now: Instant,
    ) -> Option<CursorState> {
        self.local = Some(CursorState {
            document_id: document_id.into(),
            position,
            selection,
            seq: self.seq,
        });

        if self.window_open(now) {
            self.emit(now)
        } else {
            self.pending = true;
            None
        }
    }

    /// Release the coalesced local state if its window has closed.
    pub fn flush_due(&mut self, now: Instant) -> Option<CursorState> {
        if self.pending && self.window_open(now) {
            self.emit(now)
        } else {
            None
        }
    }

    /// Re-send the latest local state regardless of throttling.
    pub fn announce_local(&mut self, now: Instant) -> Option<CursorState> {
        self.local.as_ref()?;
        self.emit(now)
    }

    pub fn local(&self) -> Option<&CursorState> {
        self.local.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    fn window_open(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) => now.saturating_duration_since(last) >= self.throttle,
            None => true,
        }
    }

    fn emit(&mut self, now: Instant) -> Option<CursorState> {
        let local = self.local.as_mut()?;
        self.seq += 1;
        local.seq = self.seq;
        self.pending = false;
        self.last_sent = Some(now);
        Some(local.clone())
    }

    // ── Remote side ─────────────────────────────────────────────

    /// Apply a remote cursor frame.
    ///
    /// Last-writer-wins by sender sequence: a frame older than the stored
    /// one is rejected, anything else replaces it wholesale.
    pub fn on_remote_update(&mut self, client_id: &ClientId, cursor: CursorState) -> bool {
        if let Some(current) = self.remote.get(client_id) {
            if cursor.seq < current.seq {
                log::trace!(
                    "Dropping stale cursor from {client_id}: seq {} < {}",
                    cursor.seq,
                    current.seq
                );
                return false;
            }
        }
        self.remote.insert(client_id.clone(), cursor);
        true
    }

    pub fn latest(&self, client_id: &ClientId) -> Option<&CursorState> {
        self.remote.get(client_id)
    }

    pub fn remove(&mut self, client_id: &ClientId) -> Option<CursorState> {
        self.remote.remove(client_id)
    }

    /// Replace every remote cursor with an authoritative set.
    pub fn replace_all(&mut self, cursors: impl IntoIterator<Item = (ClientId, CursorState)>) {
        self.remote = cursors.into_iter().collect();
    }

    /// Remote cursors inside one document, ordered by client id.
    pub fn in_document(&self, document_id: &str) -> Vec<(ClientId, CursorState)> {
        let mut cursors: Vec<(ClientId, CursorState)> = self
            .remote
            .iter()
            .filter(|(_, c)| c.document_id == document_id)
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        cursors.sort_by(|a, b| a.0.cmp(&b.0));
        cursors
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}
