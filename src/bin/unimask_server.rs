use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use unimask_rs::config::{
    AuthOverrides, ConfigOverrides, ServerOverrides, StorageOverrides, UnimaskConfig,
};
use unimask_rs::{Authenticator, CommitPolicy, LazyCommitter, Server, Store};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"unimask_server - Unimask claim store server

USAGE:
    unimask_server [OPTIONS]

OPTIONS:
    -c, --config <FILE>         Path to config file (TOML)
    -l, --listen <ADDR>         Override listen address [default: 127.0.0.1:7171]
    -d, --data-dir <DIR>        Override data directory [default: unimask-data]
        --shards <N>            Shard count for a new data directory [default: 16]
        --cache-mb <MB>         Shared block cache size [default: 256]
        --commit-delay-ms <MS>  Age of unflushed writes before commit [default: 5000]
        --read-timeout-ms <MS>  Bound on handshakes and partially read frames [default: 30000]
        --idle-timeout-ms <MS>  Close connections idle between frames this long [default: 300000]
        --secret <SECRET>       Shared handshake secret
    -h, --help                  Print help

ENVIRONMENT:
    UNIMASK_CONFIG              Path to config file
    UNIMASK_SECRET              Shared handshake secret
    UNIMASK_SERVER__LISTEN      Listen address
    UNIMASK_STORAGE__DATA_DIR   Data directory
    RUST_LOG                    Log filter [default: info]

CONFIG FILE (unimask.toml):
    [server]
    listen = "0.0.0.0:7171"

    [storage]
    data_dir = "/var/lib/unimask"
    shard_count = 32

    [auth]
    secret = "change-me"
"#
    );
}

fn build_overrides() -> anyhow::Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::default();

    let mut server = ServerOverrides::default();
    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        server.listen = Some(listen.parse()?);
    }
    if let Some(timeout) = parse_arg("--read-timeout-ms") {
        server.read_timeout_ms = Some(timeout.parse()?);
    }
    if let Some(timeout) = parse_arg("--idle-timeout-ms") {
        server.idle_timeout_ms = Some(timeout.parse()?);
    }
    if server.listen.is_some()
        || server.read_timeout_ms.is_some()
        || server.idle_timeout_ms.is_some()
    {
        overrides.server = Some(server);
    }

    let mut storage = StorageOverrides::default();
    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        storage.data_dir = Some(dir.into());
    }
    if let Some(shards) = parse_arg("--shards") {
        storage.shard_count = Some(shards.parse()?);
    }
    if let Some(cache_mb) = parse_arg("--cache-mb") {
        storage.cache_mb = Some(cache_mb.parse()?);
    }
    if let Some(delay) = parse_arg("--commit-delay-ms") {
        storage.commit_delay_ms = Some(delay.parse()?);
    }
    if storage.data_dir.is_some()
        || storage.shard_count.is_some()
        || storage.cache_mb.is_some()
        || storage.commit_delay_ms.is_some()
    {
        overrides.storage = Some(storage);
    }

    if let Some(secret) = parse_arg("--secret").or_else(|| std::env::var("UNIMASK_SECRET").ok()) {
        overrides.auth = Some(AuthOverrides {
            secret: Some(secret),
        });
    }

    Ok(overrides)
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("UNIMASK_CONFIG").ok());
    let config = UnimaskConfig::load(config_path.as_deref(), build_overrides()?)?;

    let storage = config.storage.clone();
    let store = Arc::new(tokio::task::spawn_blocking(move || Store::open(&storage)).await??);
    let committer = LazyCommitter::new(
        Arc::clone(&store),
        CommitPolicy::from_config(&config.storage),
    )
    .spawn()?;

    let authenticator = Authenticator::new(&config.auth.secret)?;
    let server = Server::bind(&config.server, Arc::clone(&store), authenticator).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    wait_for_signal().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    server_task.await??;

    let final_pass = tokio::task::spawn_blocking(move || committer.stop()).await?;
    if let Err(err) = final_pass {
        tracing::error!(error = %err, "final lazy commit failed, retrying synchronously");
    }
    let stats = store.stats();
    let flushed = tokio::task::spawn_blocking(move || store.commit_all()).await??;
    tracing::info!(
        flushed,
        linked = stats.claims_linked,
        rejected = stats.claims_rejected,
        hints_written = stats.hints_written,
        hints_served = stats.hints_served,
        "unimask server stopped"
    );
    Ok(())
}
