//! Lazy, coalescing persistence of dirty shards.
//!
//! Writes only mark a shard dirty. A background thread commits a shard once
//! its oldest unflushed change is older than the configured delay, so bursts
//! of claims against the same shard cost one commit.

use crate::config::StorageConfig;
use crate::store::Store;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Time of the oldest unflushed write, per shard.
#[derive(Debug, Default)]
pub struct DirtyShards {
    first_dirty: Mutex<HashMap<usize, Instant>>,
}

impl DirtyShards {
    pub fn mark(&self, shard: usize) {
        self.mark_at(shard, Instant::now());
    }

    /// Record `now` for `shard` unless an older mark is already present.
    pub fn mark_at(&self, shard: usize, now: Instant) {
        self.first_dirty.lock().entry(shard).or_insert(now);
    }

    pub fn first_dirty(&self, shard: usize) -> Option<Instant> {
        self.first_dirty.lock().get(&shard).copied()
    }

    pub fn len(&self) -> usize {
        self.first_dirty.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_dirty.lock().is_empty()
    }

    /// Remove and return the shards dirty for longer than `delay` (all of
    /// them when `force` is set), in shard order.
    ///
    /// Entries are cleared before the caller commits, so a write racing with
    /// the commit re-marks the shard and is picked up by a later pass.
    pub fn take_due(&self, now: Instant, delay: Duration, force: bool) -> Vec<usize> {
        let mut first_dirty = self.first_dirty.lock();
        let mut due: Vec<usize> = first_dirty
            .iter()
            .filter(|(_, since)| force || now.saturating_duration_since(**since) > delay)
            .map(|(shard, _)| *shard)
            .collect();
        due.sort_unstable();
        for shard in &due {
            first_dirty.remove(shard);
        }
        due
    }
}

/// When the committer flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    /// Minimum age of the oldest unflushed write before a shard is committed
    pub delay: Duration,
    /// Scan interval
    pub tick: Duration,
}

impl CommitPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            delay: config.commit_delay(),
            tick: config.commit_tick(),
        }
    }
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

pub struct LazyCommitter {
    store: Arc<Store>,
    policy: CommitPolicy,
    commits: AtomicU64,
}

impl LazyCommitter {
    pub fn new(store: Arc<Store>, policy: CommitPolicy) -> Self {
        Self {
            store,
            policy,
            commits: AtomicU64::new(0),
        }
    }

    /// Shard commits that wrote at least one entry.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Commit every shard that is due at `now`. With `force`, every shard
    /// holding unflushed writes is due regardless of age.
    ///
    /// A failing shard does not stop the others; the first error is returned
    /// after the pass. Failed commits are not retried here.
    pub fn run_pass(&self, now: Instant, force: bool) -> Result<usize> {
        let mut due = self
            .store
            .dirty()
            .take_due(now, self.policy.delay, force);
        if force {
            for index in 0..self.store.shard_count() {
                let buffered = self
                    .store
                    .shard(index)
                    .is_some_and(|shard| shard.is_dirty());
                if buffered && !due.contains(&index) {
                    due.push(index);
                }
            }
        }

        let mut written = 0;
        let mut first_error = None;
        for index in due {
            let Some(shard) = self.store.shard(index) else {
                continue;
            };
            match shard.commit() {
                Ok(0) => {}
                Ok(count) => {
                    self.commits.fetch_add(1, Ordering::Relaxed);
                    written += count;
                }
                Err(err) => {
                    error!(shard = index, error = %err, "shard commit failed");
                    first_error
                        .get_or_insert_with(|| anyhow!("commit of shard {index} failed: {err}"));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Start the background loop.
    pub fn spawn(self) -> Result<CommitterHandle> {
        let committer = Arc::new(self);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker = Arc::clone(&committer);
        let thread = thread::Builder::new()
            .name("unimask-committer".to_string())
            .spawn(move || -> Result<usize> {
                loop {
                    match stop_rx.recv_timeout(worker.policy.tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            match worker.run_pass(Instant::now(), false) {
                                Ok(0) => {}
                                Ok(written) => debug!(written, "lazy commit pass"),
                                // Already logged per shard.
                                Err(_) => {}
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let written = worker.run_pass(Instant::now(), true)?;
                info!(
                    written,
                    commits = worker.commits(),
                    "committer stopped after final flush"
                );
                Ok(written)
            })?;

        Ok(CommitterHandle {
            committer,
            stop_tx,
            thread: Some(thread),
        })
    }
}

/// Running committer. Stopping it performs a final forced pass.
pub struct CommitterHandle {
    committer: Arc<LazyCommitter>,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<Result<usize>>>,
}

impl CommitterHandle {
    pub fn commits(&self) -> u64 {
        self.committer.commits()
    }

    /// Signal the loop, wait for its final forced pass and return that
    /// pass's result.
    pub fn stop(mut self) -> Result<usize> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<usize> {
        let Some(thread) = self.thread.take() else {
            return Ok(0);
        };
        let _ = self.stop_tx.try_send(());
        thread
            .join()
            .map_err(|_| anyhow!("committer thread panicked"))?
    }
}

impl Drop for CommitterHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "final commit failed");
        }
    }
}
