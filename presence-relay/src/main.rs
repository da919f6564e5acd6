//! Presence relay server.
//!
//! Usage: `presence-relay [ADDR]`. Falls back to `PRESENCE_RELAY_ADDR`,
//! then to the default bind address. Verbosity follows `RUST_LOG`.

use log::info;
use presence_sync::{PresenceServer, ServerConfig};

const ADDR_ENV: &str = "PRESENCE_RELAY_ADDR";

fn bind_addr(arg: Option<String>, env: Option<String>) -> String {
    arg.or(env)
        .filter(|addr| !addr.trim().is_empty())
        .unwrap_or_else(|| ServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: bind_addr(std::env::args().nth(1), std::env::var(ADDR_ENV).ok()),
        ..ServerConfig::default()
    };
    info!("Starting presence relay on {}...", config.bind_addr);

    let server = PresenceServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
