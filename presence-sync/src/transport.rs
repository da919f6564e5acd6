//! WebSocket transport channel with automatic reconnection.
//!
//! One background task owns the socket:
//! ```text
//!            ┌────────────┐  connect ok  ┌──────┐
//!  start ──► │ connecting │ ───────────► │ open │ ──► hello frame first
//!            └────────────┘              └──┬───┘
//!                  ▲  backoff (1s → 30s,    │ socket lost
//!                  │  with jitter)          ▼
//!            ┌──────────────┐ ◄──────── (any state)
//!            │ reconnecting │
//!            └──────────────┘     close() ──► closed (terminal)
//! ```
//!
//! Inbound frames and state transitions are delivered on a single ordered
//! stream of [`TransportEvent`]s, so a consumer always sees `Open` before
//! the first frame of that connection.
//!
//! Reference: Kleppmann, Chapter 8 — Unreliable Networks

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::SessionConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

/// Item of the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    State(ConnectionState),
    Frame(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by server")]
    ClosedByServer,
}

/// Exponential reconnect delay with jitter.
///
/// The n-th consecutive failure waits `base * 2^n` capped at `cap`, plus a
/// random extra of up to half that, never exceeding `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let half_ms = (exp.as_millis() / 2) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=half_ms));
        (exp + jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

enum Control {
    Reconnect,
    Close {
        farewell: Option<Vec<u8>>,
        done: Option<oneshot::Sender<()>>,
    },
}

enum Exit {
    Lost(TransportError),
    Reconnect,
    Close {
        farewell: Option<Vec<u8>>,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Handle to a reconnecting WebSocket connection.
///
/// Dropping the handle aborts the background task.
pub struct TransportChannel {
    outgoing: mpsc::Sender<Vec<u8>>,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl TransportChannel {
    /// Start connecting to `<url>/<session_key>`.
    ///
    /// `hello` is sent first on every successful (re)connection. Returns
    /// the handle and the ordered inbound event stream.
    pub fn connect(
        url: &str,
        session_key: &str,
        hello: Vec<u8>,
        config: &SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let worker = Worker {
            url: format!("{}/{}", url.trim_end_matches('/'), session_key),
            hello,
            outgoing: out_rx,
            control: control_rx,
            events: event_tx,
            state: state_tx,
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
        };
        let task = tokio::spawn(worker.run());

        (
            Self {
                outgoing: out_tx,
                control: control_tx,
                state: state_rx,
                task: Some(task),
            },
            event_rx,
        )
    }

    /// Fire-and-forget send. Returns `false` when the frame was dropped
    /// because the connection is not open or the buffer is full.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        if *self.state.borrow() != ConnectionState::Open {
            return false;
        }
        match self.outgoing.try_send(bytes) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Outbound frame dropped: {e}");
                false
            }
        }
    }

    /// Drop the current connection and go through backoff again.
    pub fn reconnect(&self) {
        let _ = self.control.send(Control::Reconnect);
    }

    /// Stop reconnecting, send `farewell` if currently open, and close.
    pub async fn close(&mut self, farewell: Option<Vec<u8>>) {
        let (done_tx, done_rx) = oneshot::channel();
        let close = Control::Close {
            farewell,
            done: Some(done_tx),
        };
        if self.control.send(close).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel following every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Worker {
    url: String,
    hello: Vec<u8>,
    outgoing: mpsc::Receiver<Vec<u8>>,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let attempt = tokio::select! {
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
                control = next_control(&mut self.control) => match control {
                    Control::Close { done, .. } => return self.finish(done),
                    Control::Reconnect => continue,
                },
            };

            match attempt {
                Ok((stream, _)) => {
                    let (mut sink, mut source) = stream.split();
                    if let Err(e) = sink.send(Message::Binary(self.hello.clone().into())).await {
                        log::warn!("Failed to send hello to {}: {e}", self.url);
                    } else {
                        self.backoff.reset();
                        // Anything buffered belongs to a previous connection.
                        while self.outgoing.try_recv().is_ok() {}
                        self.set_state(ConnectionState::Open);
                        log::info!("Connected to {}", self.url);

                        match self.pump(&mut sink, &mut source).await {
                            Exit::Close { farewell, done } => {
                                if let Some(bytes) = farewell {
                                    let _ = sink.send(Message::Binary(bytes.into())).await;
                                }
                                let _ = sink.close().await;
                                return self.finish(done);
                            }
                            Exit::Reconnect => {
                                log::info!("Reconnect requested for {}", self.url);
                                let _ = sink.close().await;
                            }
                            Exit::Lost(e) => {
                                log::warn!("Connection to {} lost: {e}", self.url);
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Connect to {} failed: {e}", self.url);
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            log::info!(
                "Reconnecting to {} in {delay:?} (attempt {})",
                self.url,
                self.backoff.attempt()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                control = next_control(&mut self.control) => {
                    if let Control::Close { done, .. } = control {
                        return self.finish(done);
                    }
                }
            }
        }
    }

    async fn pump(&mut self, sink: &mut WsSink, source: &mut WsSource) -> Exit {
        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = self.events.send(TransportEvent::Frame(data.to_vec()));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.events.send(TransportEvent::Frame(text.as_bytes().to_vec()));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Exit::Lost(TransportError::ClosedByServer);
                    }
                    Some(Err(e)) => return Exit::Lost(e.into()),
                    Some(Ok(_)) => {}
                },
                Some(bytes) = self.outgoing.recv() => {
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        return Exit::Lost(e.into());
                    }
                }
                control = next_control(&mut self.control) => match control {
                    Control::Reconnect => return Exit::Reconnect,
                    Control::Close { farewell, done } => return Exit::Close { farewell, done },
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state);
        let _ = self.events.send(TransportEvent::State(state));
    }

    fn finish(&self, done: Option<oneshot::Sender<()>>) {
        self.set_state(ConnectionState::Closed);
        log::info!("Transport to {} closed", self.url);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

/// Next control message; a dropped handle counts as a close.
async fn next_control(control: &mut mpsc::UnboundedReceiver<Control>) -> Control {
    control.recv().await.unwrap_or(Control::Close {
        farewell: None,
        done: None,
    })
}
