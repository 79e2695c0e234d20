use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use unimask_rs::config::{ServerConfig, StorageConfig};
use unimask_rs::{Authenticator, Server, Store};

#[allow(dead_code)]
pub const SECRET: &str = "integration-secret";

#[allow(dead_code)]
pub fn storage_config(path: &Path, shard_count: usize) -> StorageConfig {
    StorageConfig {
        shard_count,
        cache_mb: 8,
        compact_on_commit: false,
        ..StorageConfig::at(path)
    }
}

#[allow(dead_code)]
pub fn open_store(path: &Path, shard_count: usize) -> Arc<Store> {
    Arc::new(Store::open(&storage_config(path, shard_count)).expect("open store"))
}

/// Candidate generator used by the probing tests: every source masks to the
/// same base value, and iteration `i > 0` appends `i + 1`.
#[allow(dead_code)]
pub fn colliding_mask(_source: &str, iteration: u32) -> String {
    if iteration == 0 {
        "XYZ".to_string()
    } else {
        format!("XYZ{}", iteration + 1)
    }
}

#[allow(dead_code)]
pub struct RunningServer {
    pub addr: SocketAddr,
    pub store: Arc<Store>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

#[allow(dead_code)]
impl RunningServer {
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.handle.await?
    }
}

#[allow(dead_code)]
pub async fn spawn_server(store: Arc<Store>, read_timeout: Duration) -> anyhow::Result<RunningServer> {
    spawn_server_with_idle(store, read_timeout, Duration::from_secs(60)).await
}

#[allow(dead_code)]
pub async fn spawn_server_with_idle(
    store: Arc<Store>,
    read_timeout: Duration,
    idle_timeout: Duration,
) -> anyhow::Result<RunningServer> {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse()?,
        read_timeout_ms: read_timeout.as_millis() as u64,
        idle_timeout_ms: idle_timeout.as_millis() as u64,
    };
    let server = Server::bind(&config, Arc::clone(&store), Authenticator::new(SECRET)?).await?;
    let addr = server.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.serve(shutdown_rx));
    Ok(RunningServer {
        addr,
        store,
        shutdown,
        handle,
    })
}
