use std::sync::Arc;

use log::info;
use tessera_collab::{MemoryStore, ServerConfig, SyncManager, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Tessera sync server on {}...", config.bind_addr);

    let manager = SyncManager::with_persistence(config.manager.clone(), Arc::new(MemoryStore::new()));
    let server = SyncServer::with_manager(config, manager.clone());

    let shutdown = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.shutdown().await;
        }
    });

    server.run().await
}
