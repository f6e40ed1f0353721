use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{AppContext, http};

/// Accepts client connections until `shutdown` flips to `true` (or its sender is dropped),
/// then waits up to the configured grace period for in-flight connections before aborting
/// the rest. The listener is released when this returns.
pub async fn serve(
    listener: TcpListener,
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "proxy listener started");
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
                }
                let connection_app = app.clone();
                let connection_shutdown = shutdown.clone();
                connections.spawn(async move {
                    if let Err(err) = http::server::serve_connection(
                        stream,
                        peer_addr,
                        connection_app,
                        connection_shutdown,
                    )
                    .await
                    {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    let grace = app.settings.shutdown_grace_period();
    info!(
        in_flight = connections.len(),
        grace_secs = grace.as_secs(),
        "shutting down; draining connections"
    );
    let drained = timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "grace period elapsed; aborting remaining connections"
        );
        connections.shutdown().await;
    }
    drop(listener);
    info!(address = %local_addr, "proxy listener stopped");
    Ok(())
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
