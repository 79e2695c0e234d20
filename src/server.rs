//! TCP front end of the claim store.
//!
//! Every accepted connection gets its own task: it runs the handshake, then
//! serves claim batches one frame at a time until the peer disconnects,
//! violates the protocol, or the server shuts down.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::protocol::{encode_batch_response, read_batch_body, read_opcode};
use crate::store::Store;
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

struct ConnectionContext {
    store: Arc<Store>,
    authenticator: Authenticator,
    read_timeout: Duration,
    idle_timeout: Duration,
}

pub struct Server {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
}

impl Server {
    /// Bind the listen address. Port 0 picks a free port; see [`Server::local_addr`].
    pub async fn bind(
        config: &ServerConfig,
        store: Arc<Store>,
        authenticator: Authenticator,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("bind tcp listener {}", config.listen))?;
        Ok(Self {
            listener,
            context: Arc::new(ConnectionContext {
                store,
                authenticator,
                read_timeout: config.read_timeout(),
                idle_timeout: config.idle_timeout(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` turns true (or its sender is
    /// dropped), then wait for every connection handler to finish.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!(%local_addr, "unimask server listening");

        let mut connections = JoinSet::new();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let context = Arc::clone(&self.context);
                            let span = info_span!("connection", %peer);
                            connections.spawn(
                                serve_connection(context, stream, peer, shutdown.clone())
                                    .instrument(span),
                            );
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "connection task failed");
                    }
                }
            }
        }

        drop(self.listener);
        info!(open = connections.len(), "server stopping, draining connections");
        while let Some(joined) = connections.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "connection task failed");
            }
        }
        info!("server stopped");
        Ok(())
    }
}

async fn serve_connection(
    context: Arc<ConnectionContext>,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    debug!("connection accepted");
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "could not disable nagle");
    }
    match handle_connection(&context, &mut stream, shutdown).await {
        Ok(batches) => debug!(batches, "connection closed"),
        Err(err) => warn!(%peer, error = %err, "connection terminated"),
    }
}

/// Run the handshake and serve batches. Returns the number of batches served.
async fn handle_connection(
    context: &ConnectionContext,
    stream: &mut TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let accepted = timeout(context.read_timeout, context.authenticator.accept(&mut *stream))
        .await
        .map_err(|_| anyhow!("handshake timed out"))?
        .context("handshake failed")?;
    if !accepted {
        return Err(anyhow!("authentication rejected"));
    }
    debug!("client authenticated");

    let mut batches = 0;
    loop {
        let opcode = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("shutdown requested, closing connection");
                    return Ok(batches);
                }
                continue;
            }
            opcode = timeout(context.idle_timeout, read_opcode(&mut *stream)) => {
                opcode.map_err(|_| anyhow!("idle connection timed out"))??
            }
        };
        let Some(opcode) = opcode else {
            return Ok(batches);
        };

        let batch = timeout(context.read_timeout, read_batch_body(&mut *stream, opcode))
            .await
            .map_err(|_| anyhow!("timed out reading claim batch"))?
            .context("protocol violation")?;
        let count = batch.requests.len();

        let store = Arc::clone(&context.store);
        let responses = tokio::task::spawn_blocking(move || {
            store.store_claim(&batch.repository, &batch.requests)
        })
        .await
        .context("claim task panicked")??;

        let frame = encode_batch_response(&responses)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        batches += 1;
        debug!(count, "claim batch served");
    }
}
