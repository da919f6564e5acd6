//! Follow mode: make the local view track one collaborator's cursor.
//!
//! ```text
//!            follow(X), X present
//!   ┌──────┐ ───────────────────────► ┌──────────────┐
//!   │ idle │                          │ following(X) │ ── cursor from X ──► NavigateIntent
//!   └──────┘ ◄─────────────────────── └──────────────┘
//!             unfollow / X removed /
//!             local cursor action
//! ```
//!
//! The controller only reads cursor state; it never mutates it.

use crate::presence::PresenceRegistry;
use crate::protocol::{ClientId, CursorState, Position};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FollowState {
    #[default]
    Idle,
    Following(ClientId),
}

/// Why follow mode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Unfollowed,
    TargetLeft,
    ManualOverride,
    /// Another collaborator was followed instead.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowEvent {
    Started(ClientId),
    Stopped { target: ClientId, reason: StopReason },
}

/// Request for the editor surface to show a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigateIntent {
    pub target: ClientId,
    pub document_id: String,
    pub position: Position,
}

pub struct FollowController {
    local_client_id: ClientId,
    state: FollowState,
}

impl FollowController {
    pub fn new(local_client_id: ClientId) -> Self {
        Self {
            local_client_id,
            state: FollowState::Idle,
        }
    }

    pub fn state(&self) -> &FollowState {
        &self.state
    }

    pub fn target(&self) -> Option<&ClientId> {
        match &self.state {
            FollowState::Following(target) => Some(target),
            FollowState::Idle => None,
        }
    }

    /// Start following `target`.
    ///
    /// No-op (empty result) when the target is not in the registry, is the
    /// local client, or is already followed.
    pub fn follow(&mut self, target: &ClientId, registry: &PresenceRegistry) -> Vec<FollowEvent> {
        if *target == self.local_client_id || !registry.contains(target) {
            log::debug!("Ignoring follow request for unknown collaborator {target}");
            return Vec::new();
        }
        if self.target() == Some(target) {
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(previous) = self.stop(StopReason::Replaced) {
            events.push(previous);
        }
        self.state = FollowState::Following(target.clone());
        events.push(FollowEvent::Started(target.clone()));
        events
    }

    pub fn unfollow(&mut self) -> Option<FollowEvent> {
        self.stop(StopReason::Unfollowed)
    }

    /// The followed collaborator left the registry.
    pub fn on_collaborator_removed(&mut self, client_id: &ClientId) -> Option<FollowEvent> {
        if self.target() == Some(client_id) {
            self.stop(StopReason::TargetLeft)
        } else {
            None
        }
    }

    /// The local user moved their own cursor or switched documents.
    pub fn on_local_action(&mut self) -> Option<FollowEvent> {
        self.stop(StopReason::ManualOverride)
    }

    /// Derive a navigation intent from a cursor update of the target.
    pub fn on_cursor(&self, client_id: &ClientId, cursor: &CursorState) -> Option<NavigateIntent> {
        if self.target() != Some(client_id) {
            return None;
        }
        Some(NavigateIntent {
            target: client_id.clone(),
            document_id: cursor.document_id.clone(),
            position: cursor.position,
        })
    }

    /// Drop the target if it is missing from `registry`.
    pub fn ensure_present(&mut self, registry: &PresenceRegistry) -> Option<FollowEvent> {
        match self.target() {
            Some(target) if !registry.contains(target) => self.stop(StopReason::TargetLeft),
            _ => None,
        }
    }

    fn stop(&mut self, reason: StopReason) -> Option<FollowEvent> {
        match std::mem::take(&mut self.state) {
            FollowState::Following(target) => Some(FollowEvent::Stopped { target, reason }),
            FollowState::Idle => None,
        }
    }
}
