//! Async session client.
//!
//! One driver task exclusively owns the [`Session`] and the transport.
//! Everything that touches session state funnels through it:
//!
//! ```text
//! SessionClient ── Command (mpsc, oneshot reply) ──┐
//! SessionClient ── local cursor (watch, latest) ───┤
//! TransportChannel ── TransportEvent (ordered) ────┼──► driver ──► Session
//! timers: status 5s, cursor flush 50ms, keepalive ─┘       │
//!                                                          ├──► frames ──► TransportChannel
//!                                                          └──► SessionEvent (broadcast)
//! ```
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::time::Instant;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::SessionConfig;
use crate::follow::FollowState;
use crate::presence::Collaborator;
use crate::protocol::{ChatMessage, ClientId, CursorState, EncodeError, Position, Selection};
use crate::session::{LocalIdentity, Outcome, Session, SessionEvent};
use crate::transport::{ConnectionState, TransportChannel, TransportEvent};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session driver has stopped")]
    DriverGone,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Most recent local caret. Only the latest value matters, so it travels
/// over a `watch` channel instead of the command queue.
#[derive(Debug, Clone)]
struct LocalCursor {
    document_id: String,
    position: Position,
    selection: Option<Selection>,
}

enum Command {
    SendChat {
        text: String,
        reply: oneshot::Sender<Option<ChatMessage>>,
    },
    Follow {
        target: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Unfollow(oneshot::Sender<bool>),
    ListActive(oneshot::Sender<Vec<Collaborator>>),
    History(oneshot::Sender<Vec<ChatMessage>>),
    LatestCursor(ClientId, oneshot::Sender<Option<CursorState>>),
    FollowTarget(oneshot::Sender<Option<ClientId>>),
    Close(oneshot::Sender<()>),
}

/// Handle to one live collaboration session.
///
/// Cheap queries and commands are forwarded to the driver task. Dropping
/// the handle aborts the driver and, with it, the transport.
pub struct SessionClient {
    client_id: ClientId,
    commands: mpsc::Sender<Command>,
    local_cursor: watch::Sender<Option<LocalCursor>>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<ConnectionState>,
    driver: Option<JoinHandle<()>>,
}

impl SessionClient {
    /// Join `session_key` on the relay at `url`.
    ///
    /// Returns immediately; the connection is established in the
    /// background and reported through [`subscribe`](Self::subscribe).
    pub fn connect(
        config: SessionConfig,
        identity: LocalIdentity,
        url: &str,
        session_key: &str,
    ) -> Result<Self, ClientError> {
        let client_id = identity.client_id.clone();
        let session = Session::new(identity, &config);
        let hello = session.hello_frame().encode()?;

        let (transport, inbound) = TransportChannel::connect(url, session_key, hello, &config);
        let state = transport.watch_state();
        let (command_tx, command_rx) = mpsc::channel(config.outbound_capacity);
        let (cursor_tx, cursor_rx) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let driver = Driver {
            session,
            transport,
            inbound,
            commands: command_rx,
            local_cursor: cursor_rx,
            events: event_tx.clone(),
            config,
        };
        log::info!("Session client {client_id} joining {session_key}");

        Ok(Self {
            client_id,
            commands: command_tx,
            local_cursor: cursor_tx,
            events: event_tx,
            state,
            driver: Some(tokio::spawn(driver.run())),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Report a local caret/selection move. Fire-and-forget.
    ///
    /// Moves reported faster than the driver consumes them overwrite each
    /// other; the latest one is always applied.
    pub fn report_local(
        &self,
        document_id: impl Into<String>,
        position: Position,
        selection: Option<Selection>,
    ) -> Result<(), ClientError> {
        if self.local_cursor.is_closed() {
            return Err(ClientError::DriverGone);
        }
        self.local_cursor.send_replace(Some(LocalCursor {
            document_id: document_id.into(),
            position,
            selection,
        }));
        Ok(())
    }

    /// Post a chat message. `None` when the text was empty.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<Option<ChatMessage>, ClientError> {
        let text = text.into();
        self.request(|reply| Command::SendChat { text, reply }).await
    }

    /// Follow `target`. `false` when the target is unknown.
    pub async fn follow(&self, target: &ClientId) -> Result<bool, ClientError> {
        let target = target.clone();
        self.request(|reply| Command::Follow { target, reply }).await
    }

    /// Leave follow mode. `false` when nothing was followed.
    pub async fn unfollow(&self) -> Result<bool, ClientError> {
        self.request(Command::Unfollow).await
    }

    pub async fn list_active(&self) -> Result<Vec<Collaborator>, ClientError> {
        self.request(Command::ListActive).await
    }

    pub async fn history(&self) -> Result<Vec<ChatMessage>, ClientError> {
        self.request(Command::History).await
    }

    pub async fn latest_cursor(&self, client_id: &ClientId) -> Result<Option<CursorState>, ClientError> {
        let client_id = client_id.clone();
        self.request(|reply| Command::LatestCursor(client_id, reply)).await
    }

    pub async fn follow_target(&self) -> Result<Option<ClientId>, ClientError> {
        self.request(Command::FollowTarget).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Send `leave` if connected, stop reconnecting and wait for the
    /// driver to finish. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.request(Command::Close).await.is_err() {
            log::debug!("Session {} already closed", self.client_id);
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| ClientError::DriverGone)?;
        reply_rx.await.map_err(|_| ClientError::DriverGone)
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct Driver {
    session: Session,
    transport: TransportChannel,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    local_cursor: watch::Receiver<Option<LocalCursor>>,
    events: broadcast::Sender<SessionEvent>,
    config: SessionConfig,
}

impl Driver {
    async fn run(mut self) {
        let mut status = ticker(self.config.status_tick).await;
        let mut flush = ticker(self.config.cursor_throttle).await;
        let mut keepalive = ticker(self.config.keepalive_interval).await;

        loop {
            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(event) => self.on_transport(event),
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Close(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                changed = self.local_cursor.changed() => {
                    if changed.is_err() {
                        self.shutdown().await;
                        break;
                    }
                    let latest = self.local_cursor.borrow_and_update().clone();
                    if let Some(local) = latest {
                        self.on_local_cursor(local);
                    }
                }
                _ = status.tick() => {
                    let out = self.session.tick(Instant::now());
                    self.dispatch(out);
                }
                _ = flush.tick() => {
                    let out = self.session.flush_cursor(Instant::now());
                    self.dispatch(out);
                }
                _ = keepalive.tick() => {
                    let out = self.session.keepalive();
                    self.dispatch(out);
                }
            }
        }
        log::debug!("Session driver for {} stopped", self.session.identity().client_id);
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::State(state) => {
                let out = self.session.on_connection_state(state);
                self.dispatch(out);
            }
            TransportEvent::Frame(bytes) => match self.session.on_bytes(&bytes, Instant::now()) {
                Ok(out) => self.dispatch(out),
                Err(e) => {
                    log::warn!("Snapshot rejected, forcing reconnect: {e}");
                    self.transport.reconnect();
                }
            },
        }
    }

    fn on_local_cursor(&mut self, local: LocalCursor) {
        let out = self.session.report_local(
            &local.document_id,
            local.position,
            local.selection,
            Instant::now(),
        );
        self.dispatch(out);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendChat { text, reply } => {
                let out = self.session.send_chat(&text);
                let message = out.events.iter().find_map(|e| match e {
                    SessionEvent::Chat(m) => Some(m.clone()),
                    _ => None,
                });
                self.dispatch(out);
                let _ = reply.send(message);
            }
            Command::Follow { target, reply } => {
                let out = self.session.follow(&target);
                let following = self.session.follow_state() == &FollowState::Following(target);
                self.dispatch(out);
                let _ = reply.send(following);
            }
            Command::Unfollow(reply) => {
                let out = self.session.unfollow();
                let stopped = !out.events.is_empty();
                self.dispatch(out);
                let _ = reply.send(stopped);
            }
            Command::ListActive(reply) => {
                let _ = reply.send(self.session.registry().list_active());
            }
            Command::History(reply) => {
                let _ = reply.send(self.session.chat().history().to_vec());
            }
            Command::LatestCursor(client_id, reply) => {
                let _ = reply.send(self.session.latest_cursor(&client_id).cloned());
            }
            Command::FollowTarget(reply) => {
                let target = match self.session.follow_state() {
                    FollowState::Following(target) => Some(target.clone()),
                    FollowState::Idle => None,
                };
                let _ = reply.send(target);
            }
            // Handled by the run loop.
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn dispatch(&mut self, out: Outcome) {
        for frame in out.frames {
            match frame.encode() {
                Ok(bytes) => {
                    if !self.transport.send(bytes) {
                        log::debug!("{} frame not sent, transport unavailable", frame.kind());
                    }
                }
                Err(e) => log::warn!("Failed to encode {} frame: {e}", frame.kind()),
            }
        }
        for event in out.events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    async fn shutdown(&mut self) {
        // Peers learn about us from the join, so an open socket gets a
        // leave even before our own snapshot has arrived.
        let farewell = if self.transport.connection_state() == ConnectionState::Open {
            self.session.leave_frame().encode().ok()
        } else {
            None
        };
        self.transport.close(farewell).await;

        while let Ok(event) = self.inbound.try_recv() {
            if let TransportEvent::State(state) = event {
                let out = self.session.on_connection_state(state);
                self.dispatch(out);
            }
        }
    }
}

/// Interval whose first, immediate tick has already been consumed.
async fn ticker(period: std::time::Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    ticker
}
