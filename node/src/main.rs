use axum::serve;
use chatmirror_node::storage::{MessageRepository, MirrorDb};
use chatmirror_node::sync::{HttpRemoteSource, LivenessMonitor, SyncEngine};
use chatmirror_node::{init_tracing, router, transport, AppConfig, AppState, ChatDirectory};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let db = MirrorDb::open(&config.db_path)?;
    let outbound = transport::from_config(&config)?;
    let remote = Arc::new(HttpRemoteSource::new(
        &config.remote_url,
        config.remote_token.clone(),
    )?);

    let directory = Arc::new(ChatDirectory::new(MessageRepository::new(db.clone())));
    let loaded = directory.load_all()?;

    let engine = SyncEngine::new(config.sync_config(), remote, db).await;
    let events = engine.subscribe();
    let checkpoint = engine.watch_checkpoint();
    let sync = engine.spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let (monitor, connectivity) = LivenessMonitor::new(Arc::clone(&outbound), config.ping_interval);
    let monitor = monitor.spawn(stop_rx.clone());
    let follower = Arc::clone(&directory).follow(events, stop_rx);

    let state = AppState::new(config.clone(), directory, outbound, connectivity, checkpoint);
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, build_id = %config.build_id, chats = loaded, "starting chatmirror node");

    serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(%err, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("shutting down");
    let _ = stop_tx.send(true);
    sync.shutdown().await?;
    let _ = tokio::join!(monitor, follower);
    Ok(())
}
