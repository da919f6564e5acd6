//! Session and relay configuration.

use std::time::Duration;

/// Timing and capacity knobs for one client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Upper bound for any reconnect delay
    pub backoff_cap: Duration,
    /// How often collaborator status is recomputed
    pub status_tick: Duration,
    /// Minimum spacing between outbound cursor frames
    pub cursor_throttle: Duration,
    /// How often the local client re-announces itself
    pub keepalive_interval: Duration,
    /// Silence below this is `active`
    pub active_threshold: Duration,
    /// Silence below this (and above `active_threshold`) is `idle`
    pub idle_threshold: Duration,
    /// Extra silence tolerated for `offline` entries before removal
    pub offline_grace: Duration,
    /// Chat messages held while the transport is down
    pub chat_queue_capacity: usize,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    /// Buffered outbound frames in the transport
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            status_tick: Duration::from_secs(5),
            cursor_throttle: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(20),
            active_threshold: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(120),
            offline_grace: Duration::from_secs(60),
            chat_queue_capacity: 50,
            event_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Total silence after which a collaborator is dropped.
    pub fn eviction_after(&self) -> Duration {
        self.idle_threshold + self.offline_grace
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum collaborators per session room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Chat ids remembered per room for redelivery stamping
    pub chat_id_memory: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            chat_id_memory: 1024,
        }
    }
}
