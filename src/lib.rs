pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::proxy::cache::{self, CacheStore, DiskStore};
use crate::proxy::origin::Scheme;
use crate::settings::Settings;

/// Runs the proxy until SIGINT or SIGTERM, then drains in-flight requests. Configuration
/// problems (origin, TLS trust anchors, cache directory) fail before anything is bound.
pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(Arc::new(settings)).await?;
    let settings = app.settings.clone();
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let bind_addr = settings.listen_addr();
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_task(shutdown_tx);
    serve(app, listener, shutdown_rx).await
}

/// Resolves the origin, its TLS client configuration and the cache store.
pub async fn build_app(settings: Arc<Settings>) -> Result<proxy::AppContext> {
    let origin = settings.origin()?;
    let tls = match origin.scheme() {
        Scheme::Https => Some(build_tls_client_config()?),
        Scheme::Http => None,
    };
    let store = cache::open_store(&settings).await?;
    info!(origin = %origin, cache = settings.cache.as_str(), "forwarding to origin");
    proxy::AppContext::new(settings, tls, store)
}

/// Serves on an already bound listener until `shutdown` flips to `true`.
pub async fn serve(
    app: proxy::AppContext,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    proxy::listener::serve(listener, app, shutdown).await
}

/// Empties the on-disk cache directory and returns the number of entries removed.
pub async fn clear_cache(settings: &Settings) -> Result<usize> {
    let root = settings.cache_dir()?;
    let store = DiskStore::open(&root)
        .await
        .with_context(|| format!("failed to open cache directory {}", root.display()))?;
    let removed = store
        .clear()
        .await
        .with_context(|| format!("failed to clear cache directory {}", root.display()))?;
    info!(removed, path = %root.display(), "cache cleared");
    Ok(removed)
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates to reach an https origin"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(unix)]
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    terminate.recv().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT; shutting down"),
            _ = terminate => info!("received SIGTERM; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(not(unix))]
fn spawn_signal_task(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
}
