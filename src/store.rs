//! # Store Module
//!
//! Owns every shard and arbitrates claim batches across them.

use crate::committer::DirtyShards;
use crate::config::StorageConfig;
use crate::model::{resolution_key, ClaimOutcome, ClaimRequest, ClaimResponse};
use crate::router::ShardRouter;
use crate::shard::{Shard, ShardOptions};
use anyhow::{anyhow, Context, Result};
use rocksdb::Cache;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, instrument};

/// Counters describing the work done by a store since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub claims_linked: u64,
    pub claims_rejected: u64,
    pub hints_written: u64,
    pub hints_served: u64,
}

#[derive(Debug, Default)]
struct StoreMetrics {
    claims_linked: AtomicU64,
    claims_rejected: AtomicU64,
    hints_written: AtomicU64,
    hints_served: AtomicU64,
}

/// All shards of one data directory.
pub struct Store {
    shards: Vec<Shard>,
    router: ShardRouter,
    dirty: DirtyShards,
    metrics: StoreMetrics,
}

impl Store {
    /// Open or create the store described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if config.shard_count == 0 {
            return Err(anyhow!("shard count must be at least 1"));
        }
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("create data directory {}", config.data_dir.display())
        })?;

        let options = ShardOptions {
            cache: (config.cache_mb > 0).then(|| Cache::new_lru_cache(config.cache_mb << 20)),
            compact_on_commit: config.compact_on_commit,
        };
        let mut shards = Vec::with_capacity(config.shard_count);
        for index in 0..config.shard_count {
            let path = shard_path(&config.data_dir, index);
            let shard = Shard::open(&path, index, config.shard_count, &options)
                .with_context(|| format!("open shard {index} at {}", path.display()))?;
            shards.push(shard);
        }
        info!(
            shards = config.shard_count,
            data_dir = %config.data_dir.display(),
            "opened claim store"
        );

        Ok(Self {
            router: ShardRouter::new(shards.len()),
            shards,
            dirty: DirtyShards::default(),
            metrics: StoreMetrics::default(),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> Option<&Shard> {
        self.shards.get(index)
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Shards holding writes that the lazy committer has not flushed yet.
    pub fn dirty(&self) -> &DirtyShards {
        &self.dirty
    }

    /// Process a batch of claims for one repository, request by request.
    ///
    /// There is no atomicity across requests: if an error aborts the batch,
    /// the requests before it have already taken effect.
    #[instrument(skip(self, requests), fields(count = requests.len()), level = "debug")]
    pub fn store_claim(
        &self,
        repository: &str,
        requests: &[ClaimRequest],
    ) -> Result<Vec<ClaimResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.claim_one(repository, request)?);
        }
        Ok(responses)
    }

    fn claim_one(&self, repository: &str, request: &ClaimRequest) -> Result<ClaimResponse> {
        let target_index = self.router.shard_for(&request.target);
        let target_shard = &self.shards[target_index];

        let outcome = target_shard.claim(repository, &request.target, &request.source)?;
        self.dirty.mark(target_index);

        match outcome {
            ClaimOutcome::OwnedBySelf => {
                self.metrics.claims_linked.fetch_add(1, Ordering::Relaxed);
                if let Some(conflict) = &request.conflict {
                    // Filed under the original candidate, not the one that won.
                    let conflict_index = self.router.shard_for(conflict);
                    self.shards[conflict_index].write_hint(
                        repository,
                        &resolution_key(conflict, &request.source),
                        request.iteration,
                    );
                    self.dirty.mark(conflict_index);
                    self.metrics.hints_written.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ClaimResponse::Linked)
            }
            ClaimOutcome::OwnedByOther => {
                self.metrics.claims_rejected.fetch_add(1, Ordering::Relaxed);
                if request.iteration != 0 {
                    return Ok(ClaimResponse::Rejected { hint: None });
                }
                let hint = target_shard.lookup_hint(
                    repository,
                    &resolution_key(&request.target, &request.source),
                )?;
                if hint.is_some() {
                    self.metrics.hints_served.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ClaimResponse::Rejected { hint })
            }
        }
    }

    /// Source bound to `target` in `repository`, if any.
    pub fn owner(&self, repository: &str, target: &str) -> Result<Option<String>> {
        self.shards[self.router.shard_for(target)].owner(repository, target)
    }

    /// Commit every shard regardless of age. Returns the entries written.
    pub fn commit_all(&self) -> Result<usize> {
        let mut written = 0;
        for shard in &self.shards {
            written += shard
                .commit()
                .with_context(|| format!("commit shard {}", shard.index()))?;
        }
        Ok(written)
    }

    /// Every claim of `repository`, ordered by target.
    pub fn claims(&self, repository: &str) -> Result<Vec<(String, String)>> {
        let mut claims = Vec::new();
        for shard in &self.shards {
            claims.extend(shard.claims(repository)?);
        }
        claims.sort();
        Ok(claims)
    }

    /// Every hint of `repository`, ordered by resolution key.
    pub fn hints(&self, repository: &str) -> Result<Vec<(String, u32)>> {
        let mut hints = Vec::new();
        for shard in &self.shards {
            hints.extend(shard.hints(repository)?);
        }
        hints.sort();
        Ok(hints)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            claims_linked: self.metrics.claims_linked.load(Ordering::Relaxed),
            claims_rejected: self.metrics.claims_rejected.load(Ordering::Relaxed),
            hints_written: self.metrics.hints_written.load(Ordering::Relaxed),
            hints_served: self.metrics.hints_served.load(Ordering::Relaxed),
        }
    }
}

fn shard_path(data_dir: &Path, index: usize) -> PathBuf {
    data_dir.join(format!("shard-{index:04}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SEP;
    use tempfile::tempdir;

    fn open_store(path: &Path, shard_count: usize) -> Store {
        Store::open(&StorageConfig {
            shard_count,
            cache_mb: 8,
            ..StorageConfig::at(path)
        })
        .unwrap()
    }

    #[test]
    fn collision_is_rejected_without_hint() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 4);

        let responses = store
            .store_claim(
                "R",
                &[
                    ClaimRequest::initial("alice", "XYZ"),
                    ClaimRequest::initial("bob", "XYZ"),
                ],
            )
            .unwrap();
        assert_eq!(
            responses,
            vec![
                ClaimResponse::Linked,
                ClaimResponse::Rejected { hint: None }
            ]
        );
    }

    #[test]
    fn successful_retry_memoizes_iteration_under_original_candidate() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 4);

        store
            .store_claim("R", &[ClaimRequest::initial("alice", "XYZ")])
            .unwrap();
        let retry = store
            .store_claim("R", &[ClaimRequest::retry("bob", "XYZ2", "XYZ", 1)])
            .unwrap();
        assert_eq!(retry, vec![ClaimResponse::Linked]);
        assert_eq!(store.hints("R").unwrap(), vec![(format!("XYZ{SEP}bob"), 1)]);

        let again = store
            .store_claim("R", &[ClaimRequest::initial("bob", "XYZ")])
            .unwrap();
        assert_eq!(again, vec![ClaimResponse::Rejected { hint: Some(1) }]);
    }

    #[test]
    fn rejected_retry_never_carries_a_hint() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 4);

        store
            .store_claim(
                "R",
                &[
                    ClaimRequest::initial("alice", "XYZ"),
                    ClaimRequest::initial("carol", "XYZ3"),
                    // Leaves a hint under XYZ3 + bob that a lookup would find.
                    ClaimRequest::retry("bob", "XYZ4", "XYZ3", 1),
                ],
            )
            .unwrap();
        let responses = store
            .store_claim("R", &[ClaimRequest::retry("bob", "XYZ3", "XYZ", 2)])
            .unwrap();
        assert_eq!(responses, vec![ClaimResponse::Rejected { hint: None }]);
        assert_eq!(store.stats().hints_served, 0);
    }

    #[test]
    fn claims_and_hints_touch_dirty_shards() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 8);

        store
            .store_claim("R", &[ClaimRequest::retry("bob", "XYZ2", "XYZ", 1)])
            .unwrap();
        let target_shard = store.router().shard_for("XYZ2");
        let conflict_shard = store.router().shard_for("XYZ");
        assert!(store.dirty().first_dirty(target_shard).is_some());
        assert!(store.dirty().first_dirty(conflict_shard).is_some());
    }

    #[test]
    fn idempotent_claim_creates_no_duplicate() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), 2);

        for _ in 0..3 {
            let responses = store
                .store_claim("R", &[ClaimRequest::initial("alice", "XYZ")])
                .unwrap();
            assert_eq!(responses, vec![ClaimResponse::Linked]);
        }
        assert_eq!(
            store.claims("R").unwrap(),
            vec![("XYZ".to_string(), "alice".to_string())]
        );
        assert_eq!(store.stats().claims_linked, 3);
    }

    #[test]
    fn zero_shards_is_an_error() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            shard_count: 0,
            ..StorageConfig::at(dir.path())
        };
        assert!(Store::open(&config).is_err());
    }
}
