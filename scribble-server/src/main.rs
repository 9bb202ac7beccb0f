use log::info;
use scribble_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting Scribble server on {} (presence ttl {}ms)",
        config.bind_addr,
        config.presence_ttl.as_millis()
    );

    SyncServer::new(config)?.run().await
}
