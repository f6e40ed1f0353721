use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use caching_proxy::settings::{CacheMode, Settings};

fn default_test_settings(origin: &str, cache_dir: &Path) -> Settings {
    Settings {
        listen_address: Ipv4Addr::LOCALHOST.into(),
        port: 0,
        origin: Some(origin.to_string()),
        cache: CacheMode::Disk,
        cache_dir: Some(cache_dir.to_path_buf()),
        client_timeout: 5,
        upstream_connect_timeout: 2,
        upstream_timeout: 5,
        shutdown_grace_period: 5,
        ..Settings::default()
    }
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    cache_dir: TempDir,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl ProxyHarness {
    pub async fn start(origin: &str) -> Result<Self> {
        Self::start_with(origin, |_| {}).await
    }

    pub async fn start_with(origin: &str, customize: impl FnOnce(&mut Settings)) -> Result<Self> {
        let cache_dir = TempDir::new()?;
        let mut settings = default_test_settings(origin, cache_dir.path());
        customize(&mut settings);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = caching_proxy::build_app(Arc::new(settings)).await?;
        let handle = tokio::spawn(caching_proxy::serve(app, listener, shutdown_rx));

        Ok(Self {
            addr,
            cache_dir,
            shutdown_tx,
            handle,
        })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    /// Every entry file currently in the cache directory.
    pub fn cache_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_files(self.cache_dir.path(), &mut files)?;
        Ok(files
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect())
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signals shutdown and waits for the listener to finish draining.
    pub async fn shutdown(self) -> Result<()> {
        self.signal_shutdown();
        self.handle
            .await
            .map_err(|err| anyhow!("proxy task failed: {err}"))?
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
