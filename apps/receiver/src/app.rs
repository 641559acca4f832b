//! Application orchestrator: wires the receiver components together.

use std::future::Future;
use std::sync::Arc;

use dbshuttle_data_channel::FileReceiver;
use dbshuttle_transfer::{ChunkStore, ResumeRegistry, Sweeper};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the receiver until SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
    serve(config, listener, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, shutting down");
        }
    })
    .await
}

/// Serves on `listener` until `shutdown` resolves or the listener fails.
pub async fn serve(
    config: Config,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Storage --
    let registry = Arc::new(ResumeRegistry::open(config.registry_path.clone())?);
    tracing::info!(active = registry.active_count(), "resumable transfers");
    let store = Arc::new(ChunkStore::new(
        config.storage_dir.clone(),
        registry,
        config.max_chunk_size,
    )?);

    // -- Sweeper --
    let sweeper = Arc::new(Sweeper::new(Arc::clone(&store), config.sweep_policy()));
    let sweep_task = tokio::spawn(Arc::clone(&sweeper).run(cancel.child_token()));

    // -- File receiver --
    let receiver = FileReceiver::new(Arc::clone(&store), config.io_timeout(), cancel.child_token());
    let server = Arc::clone(&receiver);
    let mut server_task = tokio::spawn(async move { server.serve(listener).await });

    tracing::info!(
        storage = %config.storage_dir.display(),
        max_chunk_size = config.max_chunk_size,
        "receiver ready"
    );

    // -- Main loop: wait for shutdown --
    let result = tokio::select! {
        _ = shutdown => Ok(()),
        joined = &mut server_task => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::from(e)),
                Err(e) => Err(anyhow::Error::from(e)),
            }
        }
    };

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    cancel.cancel();
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    let _ = sweep_task.await;

    result
}
