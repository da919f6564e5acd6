//! # presence-sync — presence and awareness synchronization
//!
//! Keeps every client of a shared editing session in agreement on who is
//! present, where each cursor is, who follows whom and what was said in
//! chat, over a WebSocket that may drop at any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐      WebSocket       ┌────────────────┐
//! │ SessionClient │ ◄──────────────────► │ PresenceServer │
//! │ (per tab)     │   JSON frames        │ (relay)        │
//! └───────┬───────┘                      └───────┬────────┘
//!         │ driver task                          │
//!         ▼                                      ▼
//! ┌───────────────┐                      ┌────────────────┐
//! │ Session       │                      │ BroadcastGroup │
//! │ ├ registry    │                      │ per session    │
//! │ ├ cursors     │                      │ (fan-out,      │
//! │ ├ follow      │                      │  snapshots)    │
//! │ └ chat        │                      └────────────────┘
//! └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — tagged JSON frames, validated on decode
//! - [`transport`] — reconnecting WebSocket channel with backoff
//! - [`presence`] — collaborator registry with derived status
//! - [`cursor`] — cursor tracking, outbound throttle, seq ordering
//! - [`follow`] — follow-mode state machine
//! - [`chat`] — ordered, deduplicated chat with offline queue
//! - [`reconcile`] — snapshot application on (re)connect
//! - [`session`] — synchronous state machine composing the above
//! - [`client`] — async driver around a [`Session`]
//! - [`broadcast`], [`server`] — the relay side of the protocol

pub mod broadcast;
pub mod chat;
pub mod client;
pub mod config;
pub mod cursor;
pub mod follow;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager, RoomMessage};
pub use chat::{ChatChannel, ChatUpdate, Delivery};
pub use client::{ClientError, SessionClient};
pub use config::{ServerConfig, SessionConfig};
pub use cursor::CursorTracker;
pub use follow::{FollowController, FollowEvent, FollowState, NavigateIntent, StopReason};
pub use presence::{
    assign_color, Collaborator, LeaveReason, PresenceEvent, PresenceRegistry, PresenceStatus,
};
pub use protocol::{
    ChatMessage, ClientId, CollaboratorInfo, CursorState, DecodeError, EncodeError, Frame,
    FrameKind, Position, Selection, SessionSnapshot, SnapshotEntry,
};
pub use reconcile::{apply_snapshot, ReconcileError, ReconcileOutcome};
pub use server::{PresenceServer, ServerStats};
pub use session::{LocalIdentity, Outcome, Session, SessionError, SessionEvent};
pub use transport::{Backoff, ConnectionState, TransportChannel, TransportError, TransportEvent};
