//! Standalone relay for logos-sync sessions.
//!
//! Usage: `logos-sync-server [bind-addr]`. Falls back to `LOGOS_SYNC_ADDR`,
//! then to the default `127.0.0.1:9090`.

use log::info;
use logos_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LOGOS_SYNC_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    info!("Starting logos-sync relay on {}...", config.bind_addr);
    SyncServer::new(config).run().await
}
