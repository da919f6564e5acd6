//! Session state machine.
//!
//! Owns every piece of per-session state and turns inputs (transport
//! events, local actions, timer ticks) into an [`Outcome`]: frames to send
//! and events to publish. It performs no I/O itself, so a single driver
//! task can own it without locks and tests can drive it step by step.
//!
//! ```text
//!  transport state ─┐                          ┌─► frames  ─► transport
//!  inbound bytes   ─┼─► Session ──► Outcome ───┤
//!  local actions   ─┤   (registry, cursors,    └─► events  ─► subscribers
//!  timers          ─┘    follow, chat)
//! ```
//!
//! Per connection: `open` → wait for snapshot (everything else dropped)
//! → reconcile → live. Outbound frames are only produced while live.

use std::time::Instant;

use thiserror::Error;

use crate::chat::{unix_millis, ChatChannel, ChatUpdate, Delivery};
use crate::config::SessionConfig;
use crate::cursor::CursorTracker;
use crate::follow::{FollowController, FollowEvent, FollowState, NavigateIntent};
use crate::presence::{assign_color, LeaveReason, PresenceEvent, PresenceRegistry};
use crate::protocol::{
    ChatMessage, ClientId, CollaboratorInfo, CursorState, DecodeError, Frame, FrameKind, Position,
    PresenceUpdate, Selection, SessionSnapshot,
};
use crate::reconcile::{apply_snapshot, ReconcileError};
use crate::transport::ConnectionState;

/// Who the local user is for the lifetime of a session.
///
/// The client id is generated once and survives reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub client_id: ClientId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            client_id: ClientId::generate(),
            color: assign_color(&user_id),
            user_id,
            display_name: display_name.into(),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn info(&self) -> CollaboratorInfo {
        CollaboratorInfo {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }
}

/// Something subscribers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionState),
    Presence(PresenceEvent),
    CursorMoved {
        client_id: ClientId,
        cursor: CursorState,
    },
    CursorRemoved(ClientId),
    Chat(ChatMessage),
    /// A local message moved to the slot given by the server's stamp.
    ChatRestamped(ChatMessage),
    Follow(FollowEvent),
    Navigate(NavigateIntent),
    /// Snapshot applied; the session is live.
    Reconciled,
}

/// Frames to transmit and events to publish, in order.
#[derive(Debug, Default)]
pub struct Outcome {
    pub frames: Vec<Frame>,
    pub events: Vec<SessionEvent>,
}

impl Outcome {
    fn event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("undecodable snapshot: {0}")]
    SnapshotDecode(#[source] DecodeError),
}

pub struct Session {
    identity: LocalIdentity,
    registry: PresenceRegistry,
    tracker: CursorTracker,
    follow: FollowController,
    chat: ChatChannel,
    connection: ConnectionState,
    /// Snapshot applied for the current connection.
    synced: bool,
    active_document: Option<String>,
}

impl Session {
    pub fn new(identity: LocalIdentity, config: &SessionConfig) -> Self {
        Self {
            registry: PresenceRegistry::from_config(config),
            tracker: CursorTracker::new(config.cursor_throttle),
            follow: FollowController::new(identity.client_id.clone()),
            chat: ChatChannel::new(identity.client_id.clone(), config.chat_queue_capacity),
            identity,
            connection: ConnectionState::Connecting,
            synced: false,
            active_document: None,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &CursorTracker {
        &self.tracker
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    pub fn follow_state(&self) -> &FollowState {
        self.follow.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Connected and reconciled.
    pub fn is_live(&self) -> bool {
        self.connection == ConnectionState::Open && self.synced
    }

    /// Frame sent first on every connection.
    pub fn hello_frame(&self) -> Frame {
        Frame::join(self.identity.info())
    }

    pub fn leave_frame(&self) -> Frame {
        Frame::leave(self.identity.client_id.clone())
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) -> Outcome {
        let mut out = Outcome::default();
        if state == self.connection {
            return out;
        }
        log::info!("Session {}: {:?} -> {:?}", self.identity.client_id, self.connection, state);
        self.connection = state;
        // Any transition means a new connection must be reconciled first.
        self.synced = false;
        out.event(SessionEvent::Connection(state));
        out
    }

    /// Decode and apply one inbound frame.
    ///
    /// Undecodable frames are logged and ignored, except a broken snapshot
    /// while one is awaited, which is returned so the caller can reconnect.
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) -> Result<Outcome, SessionError> {
        match Frame::decode(bytes) {
            Ok(frame) => self.on_frame(frame, now),
            Err(e) if e.kind() == Some(FrameKind::Snapshot) && self.awaiting_snapshot() => {
                Err(SessionError::SnapshotDecode(e))
            }
            Err(e) => {
                log::warn!("Dropping inbound frame: {e}");
                Ok(Outcome::default())
            }
        }
    }

    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Result<Outcome, SessionError> {
        if let Frame::Snapshot(snapshot) = frame {
            if !self.awaiting_snapshot() {
                log::debug!("Ignoring unexpected snapshot");
                return Ok(Outcome::default());
            }
            return self.reconcile(snapshot, now);
        }

        let mut out = Outcome::default();
        if !self.synced {
            log::debug!("Dropping {} frame received before snapshot", frame.kind());
            return Ok(out);
        }

        let own = frame.origin() == Some(&self.identity.client_id);
        match frame {
            Frame::Chat(message) => {
                if !own {
                    self.touch(&message.author_client_id, now, &mut out);
                }
                match self.chat.on_remote(message) {
                    ChatUpdate::Appended(m) => out.event(SessionEvent::Chat(m)),
                    ChatUpdate::Restamped(m) => out.event(SessionEvent::ChatRestamped(m)),
                    ChatUpdate::Duplicate => {}
                }
            }
            _ if own => {
                log::trace!("Ignoring own {} frame", frame.kind());
            }
            Frame::Join(info) => {
                let update = PresenceUpdate::from_info(&info, None);
                let events = self.registry.upsert(&update, now);
                self.apply_presence(events, &mut out);
            }
            Frame::PresenceUpdate(update) => {
                let events = self.registry.upsert(&update, now);
                self.apply_presence(events, &mut out);
            }
            Frame::Leave(payload) => {
                let removed = self.registry.remove(&payload.client_id, LeaveReason::Leave);
                self.apply_presence(removed.into_iter().collect(), &mut out);
            }
            Frame::Cursor(cursor) => {
                if !self.registry.contains(&cursor.client_id) {
                    log::debug!("Dropping cursor from unknown client {}", cursor.client_id);
                    return Ok(out);
                }
                self.touch(&cursor.client_id, now, &mut out);
                let state = cursor.cursor_state();
                if self.tracker.on_remote_update(&cursor.client_id, state.clone()) {
                    if let Some(intent) = self.follow.on_cursor(&cursor.client_id, &state) {
                        out.event(SessionEvent::Navigate(intent));
                    }
                    out.event(SessionEvent::CursorMoved {
                        client_id: cursor.client_id,
                        cursor: state,
                    });
                }
            }
            Frame::Snapshot(_) => {}
        }
        Ok(out)
    }

    /// Local caret or selection change.
    ///
    /// Any local cursor action ends follow mode.
    pub fn report_local(
        &mut self,
        document_id: &str,
        position: Position,
        selection: Option<Selection>,
        now: Instant,
    ) -> Outcome {
        let mut out = Outcome::default();
        if let Some(stopped) = self.follow.on_local_action() {
            out.event(SessionEvent::Follow(stopped));
        }

        if self.active_document.as_deref() != Some(document_id) {
            self.active_document = Some(document_id.to_string());
            if self.is_live() {
                out.frames.push(self.presence_frame());
            }
        }

        if let Some(state) = self.tracker.report_local(document_id, position, selection, now) {
            self.push_cursor(state, &mut out);
        }
        out
    }

    /// Release a throttled local cursor once its window has passed.
    pub fn flush_cursor(&mut self, now: Instant) -> Outcome {
        let mut out = Outcome::default();
        if let Some(state) = self.tracker.flush_due(now) {
            self.push_cursor(state, &mut out);
        }
        out
    }

    /// Compose a chat message. Whitespace-only text is a no-op.
    pub fn send_chat(&mut self, text: &str) -> Outcome {
        let mut out = Outcome::default();
        let online = self.is_live();
        let Some((message, delivery)) = self.chat.send(text, online, unix_millis()) else {
            return out;
        };
        if delivery == Delivery::Send {
            out.frames.push(Frame::chat(message.clone()));
        }
        out.event(SessionEvent::Chat(message));
        out
    }

    pub fn follow(&mut self, target: &ClientId) -> Outcome {
        let mut out = Outcome::default();
        for event in self.follow.follow(target, &self.registry) {
            out.event(SessionEvent::Follow(event));
        }
        if let Some(cursor) = self.tracker.latest(target) {
            if let Some(intent) = self.follow.on_cursor(target, cursor) {
                out.event(SessionEvent::Navigate(intent));
            }
        }
        out
    }

    pub fn unfollow(&mut self) -> Outcome {
        let mut out = Outcome::default();
        if let Some(event) = self.follow.unfollow() {
            out.event(SessionEvent::Follow(event));
        }
        out
    }

    /// Recompute statuses and evict silent collaborators.
    pub fn tick(&mut self, now: Instant) -> Outcome {
        let mut out = Outcome::default();
        let events = self.registry.tick(now);
        self.apply_presence(events, &mut out);
        out
    }

    /// Periodic presence re-announcement.
    pub fn keepalive(&self) -> Outcome {
        let mut out = Outcome::default();
        if self.is_live() {
            out.frames.push(self.presence_frame());
        }
        out
    }

    pub fn latest_cursor(&self, client_id: &ClientId) -> Option<&CursorState> {
        self.tracker.latest(client_id)
    }

    fn awaiting_snapshot(&self) -> bool {
        self.connection == ConnectionState::Open && !self.synced
    }

    fn reconcile(
        &mut self,
        snapshot: SessionSnapshot,
        now: Instant,
    ) -> Result<Outcome, SessionError> {
        let outcome = apply_snapshot(
            snapshot,
            &self.identity.client_id,
            &mut self.registry,
            &mut self.tracker,
            &mut self.follow,
            &mut self.chat,
            now,
        )?;
        self.synced = true;

        let mut out = Outcome::default();
        for event in outcome.presence {
            if let PresenceEvent::Left { client_id, .. } = &event {
                out.event(SessionEvent::CursorRemoved(client_id.clone()));
            }
            out.event(SessionEvent::Presence(event));
        }
        for (client_id, cursor) in outcome.cursors {
            out.event(SessionEvent::CursorMoved { client_id, cursor });
        }
        if let Some(event) = outcome.follow {
            out.event(SessionEvent::Follow(event));
        }

        if self.active_document.is_some() {
            out.frames.push(self.presence_frame());
        }
        if let Some(state) = self.tracker.announce_local(now) {
            out.frames
                .push(Frame::cursor(self.identity.client_id.clone(), &state));
        }
        out.frames.extend(outcome.chat_retry.into_iter().map(Frame::chat));
        out.event(SessionEvent::Reconciled);
        Ok(out)
    }

    /// Publish registry events, clearing cursor and follow state for
    /// every removal in the same step.
    fn apply_presence(&mut self, events: Vec<PresenceEvent>, out: &mut Outcome) {
        for event in events {
            if let PresenceEvent::Left { client_id, .. } = &event {
                if self.tracker.remove(client_id).is_some() {
                    out.event(SessionEvent::CursorRemoved(client_id.clone()));
                }
                if let Some(stopped) = self.follow.on_collaborator_removed(client_id) {
                    out.event(SessionEvent::Follow(stopped));
                }
            }
            out.event(SessionEvent::Presence(event));
        }
    }

    fn touch(&mut self, client_id: &ClientId, now: Instant, out: &mut Outcome) {
        if let Some(event) = self.registry.touch(client_id, now) {
            out.event(SessionEvent::Presence(event));
        }
    }

    fn push_cursor(&self, state: CursorState, out: &mut Outcome) {
        if self.is_live() {
            out.frames
                .push(Frame::cursor(self.identity.client_id.clone(), &state));
        } else {
            log::trace!("Dropping local cursor while offline");
        }
    }

    fn presence_frame(&self) -> Frame {
        Frame::presence_update(&self.identity.info(), self.active_document.clone())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.identity.client_id)
            .field("connection", &self.connection)
            .field("synced", &self.synced)
            .field("collaborators", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follow::StopReason;
    use crate::protocol::{CursorFrame, SnapshotEntry};
    use std::time::Duration;

    fn identity(id: &str) -> LocalIdentity {
        LocalIdentity {
            client_id: ClientId::from(id),
            user_id: format!("u-{id}"),
            display_name: id.to_uppercase(),
            color: "#abcdef".into(),
        }
    }

    fn entry(id: &str) -> SnapshotEntry {
        SnapshotEntry {
            client_id: ClientId::from(id),
            user_id: format!("u-{id}"),
            display_name: id.to_uppercase(),
            color: "#000000".into(),
            cursor: None,
        }
    }

    fn snapshot(ids: &[&str]) -> Frame {
        Frame::snapshot(SessionSnapshot {
            collaborators: ids.iter().map(|id| entry(id)).collect(),
            server_time: 1,
        })
    }

    fn cursor_frame(id: &str, line: u32, seq: u64) -> Frame {
        Frame::Cursor(CursorFrame {
            client_id: ClientId::from(id),
            document_id: "main.rs".into(),
            position: Position::new(line, 0),
            selection: None,
            seq,
        })
    }

    fn live_session(peers: &[&str]) -> Session {
        let mut session = Session::new(identity("me"), &SessionConfig::default());
        session.on_connection_state(ConnectionState::Open);
        session.on_frame(snapshot(peers), Instant::now()).unwrap();
        assert!(session.is_live());
        session
    }

    #[test]
    fn test_frames_before_snapshot_are_dropped() {
        let mut session = Session::new(identity("me"), &SessionConfig::default());
        session.on_connection_state(ConnectionState::Open);

        let join = Frame::join(identity("x").info());
        let out = session.on_frame(join, Instant::now()).unwrap();
        assert!(out.is_empty());
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_snapshot_makes_session_live() {
        let mut session = Session::new(identity("me"), &SessionConfig::default());
        session.on_connection_state(ConnectionState::Open);
        let out = session.on_frame(snapshot(&["x", "me"]), Instant::now()).unwrap();

        assert!(session.is_live());
        assert_eq!(session.registry().len(), 1);
        assert_eq!(out.events.last(), Some(&SessionEvent::Reconciled));
    }

    #[test]
    fn test_own_frames_are_ignored() {
        let mut session = live_session(&[]);
        let out = session
            .on_frame(Frame::presence_update(&identity("me").info(), None), Instant::now())
            .unwrap();
        assert!(out.is_empty());
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_cursor_from_unknown_client_is_dropped() {
        let mut session = live_session(&[]);
        let out = session.on_frame(cursor_frame("ghost", 1, 1), Instant::now()).unwrap();
        assert!(out.is_empty());
        assert!(session.latest_cursor(&ClientId::from("ghost")).is_none());
    }

    #[test]
    fn test_cursor_race_resolved_by_seq() {
        let mut session = live_session(&["b"]);
        let now = Instant::now();
        session.on_frame(cursor_frame("b", 20, 2), now).unwrap();
        let out = session.on_frame(cursor_frame("b", 10, 1), now).unwrap();

        assert!(!out
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::CursorMoved { .. })));
        assert_eq!(session.latest_cursor(&ClientId::from("b")).unwrap().position.line, 20);
    }

    #[test]
    fn test_follow_cleared_on_leave_event() {
        let mut session = live_session(&["x"]);
        session.follow(&ClientId::from("x"));
        assert_eq!(session.follow_state(), &FollowState::Following(ClientId::from("x")));

        let out = session
            .on_frame(Frame::leave(ClientId::from("x")), Instant::now())
            .unwrap();

        assert_eq!(session.follow_state(), &FollowState::Idle);
        assert!(out.events.contains(&SessionEvent::Follow(FollowEvent::Stopped {
            target: ClientId::from("x"),
            reason: StopReason::TargetLeft,
        })));
        assert!(out.events.contains(&SessionEvent::Presence(PresenceEvent::Left {
            client_id: ClientId::from("x"),
            reason: LeaveReason::Leave,
        })));
    }

    #[test]
    fn test_follow_cleared_on_timeout() {
        let mut session = live_session(&["x"]);
        session.follow(&ClientId::from("x"));

        let later = Instant::now() + Duration::from_secs(181);
        let out = session.tick(later);

        assert_eq!(session.follow_state(), &FollowState::Idle);
        assert!(out.events.iter().any(|e| matches!(
            e,
            SessionEvent::Follow(FollowEvent::Stopped { reason: StopReason::TargetLeft, .. })
        )));
    }

    #[test]
    fn test_follow_navigates_and_local_move_overrides() {
        let mut session = live_session(&["b"]);
        let now = Instant::now();
        session.follow(&ClientId::from("b"));

        let out = session.on_frame(cursor_frame("b", 12, 1), now).unwrap();
        assert!(out.events.iter().any(|e| matches!(
            e,
            SessionEvent::Navigate(intent) if intent.position.line == 12
        )));

        let out = session.report_local("main.rs", Position::new(3, 3), None, now);
        assert_eq!(session.follow_state(), &FollowState::Idle);
        assert!(out.events.contains(&SessionEvent::Follow(FollowEvent::Stopped {
            target: ClientId::from("b"),
            reason: StopReason::ManualOverride,
        })));

        let out = session.on_frame(cursor_frame("b", 40, 2), now).unwrap();
        assert!(!out
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::Navigate(_))));
    }

    #[test]
    fn test_local_cursor_dropped_offline_and_announced_after_reconcile() {
        let mut session = live_session(&[]);
        session.on_connection_state(ConnectionState::Reconnecting);

        let out = session.report_local("lib.rs", Position::new(8, 1), None, Instant::now());
        assert!(out.frames.is_empty());

        session.on_connection_state(ConnectionState::Open);
        let out = session.on_frame(snapshot(&[]), Instant::now()).unwrap();
        assert!(out.frames.iter().any(|f| matches!(
            f,
            Frame::Cursor(c) if c.position == Position::new(8, 1)
        )));
        assert!(out.frames.iter().any(|f| matches!(
            f,
            Frame::PresenceUpdate(p) if p.active_document_id.as_deref() == Some("lib.rs")
        )));
    }

    #[test]
    fn test_chat_queued_offline_and_flushed_on_reconcile() {
        let mut session = Session::new(identity("me"), &SessionConfig::default());
        let out = session.send_chat("hello while offline");
        assert!(out.frames.is_empty());
        assert_eq!(out.events.len(), 1);
        assert_eq!(session.chat().queued_len(), 1);

        session.on_connection_state(ConnectionState::Open);
        let out = session.on_frame(snapshot(&[]), Instant::now()).unwrap();
        let chats: Vec<&Frame> = out
            .frames
            .iter()
            .filter(|f| matches!(f, Frame::Chat(_)))
            .collect();
        assert_eq!(chats.len(), 1);
        assert_eq!(session.chat().queued_len(), 0);
    }

    #[test]
    fn test_chat_echo_is_not_duplicated() {
        let mut session = live_session(&[]);
        let out = session.send_chat("hi");
        let Frame::Chat(sent) = &out.frames[0] else {
            panic!("expected chat frame");
        };

        let mut echo = sent.clone();
        echo.sent_at += 5;
        let out = session.on_frame(Frame::chat(echo), Instant::now()).unwrap();
        assert!(matches!(out.events.as_slice(), [SessionEvent::ChatRestamped(_)]));
        assert_eq!(session.chat().history().len(), 1);
    }

    #[test]
    fn test_whitespace_chat_is_noop() {
        let mut session = live_session(&[]);
        assert!(session.send_chat("  ").is_empty());
    }

    #[test]
    fn test_broken_snapshot_is_an_error_only_while_awaited() {
        let mut session = Session::new(identity("me"), &SessionConfig::default());
        session.on_connection_state(ConnectionState::Open);

        let broken = br#"{"type":"snapshot","payload":{"collaborators":"nope","serverTime":1}}"#;
        assert!(matches!(
            session.on_bytes(broken, Instant::now()),
            Err(SessionError::SnapshotDecode(_))
        ));
        assert!(!session.is_live());

        session.on_frame(snapshot(&[]), Instant::now()).unwrap();
        assert!(session.on_bytes(broken, Instant::now()).is_ok());
    }

    #[test]
    fn test_invalid_snapshot_leaves_state_untouched() {
        let mut session = Session::new(identity("me"), &SessionConfig::default());
        session.on_connection_state(ConnectionState::Open);
        let dup = Frame::snapshot(SessionSnapshot {
            collaborators: vec![entry("x"), entry("x")],
            server_time: 1,
        });
        assert!(session.on_frame(dup, Instant::now()).is_err());
        assert!(!session.is_live());
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_malformed_frames_are_ignored() {
        let mut session = live_session(&[]);
        let out = session.on_bytes(b"not json", Instant::now()).unwrap();
        assert!(out.is_empty());
        let out = session
            .on_bytes(br#"{"type":"wave","payload":{}}"#, Instant::now())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_keepalive_only_when_live() {
        let session = Session::new(identity("me"), &SessionConfig::default());
        assert!(session.keepalive().frames.is_empty());

        let session = live_session(&[]);
        assert!(matches!(session.keepalive().frames.as_slice(), [Frame::PresenceUpdate(_)]));
    }

    #[test]
    fn test_local_identity_color_is_stable() {
        let a = LocalIdentity::new("user-1", "Ada");
        let b = LocalIdentity::new("user-1", "Ada");
        assert_eq!(a.color, b.color);
        assert_ne!(a.client_id, b.client_id);
        assert_eq!(a.with_color("#123456").color, "#123456");
    }
}
