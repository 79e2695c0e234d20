//! A single hash partition of the claim store.
//!
//! Each shard owns one RocksDB instance with two data column families:
//! `claims` (target -> source) and `hints` (resolution key -> iteration).
//! Keys are namespaced by repository. Writes are buffered in an in-memory
//! overlay until [`Shard::commit`] hands them to RocksDB in one batch.

use crate::model::ClaimOutcome;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

const CF_CLAIMS: &str = "claims";
const CF_HINTS: &str = "hints";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ShardManifest {
    format_version: u32,
    shard_index: u32,
    shard_count: u32,
    app_version: String,
}

/// Options shared by every shard of a store.
#[derive(Clone, Default)]
pub struct ShardOptions {
    /// Block cache shared across shards; `None` uses RocksDB's default.
    pub cache: Option<Cache>,
    /// Compact both data column families after each commit.
    pub compact_on_commit: bool,
}

pub struct Shard {
    index: usize,
    inner: Mutex<ShardInner>,
}

struct ShardInner {
    db: DB,
    pending: Pending,
    compact_on_commit: bool,
}

#[derive(Default)]
struct Pending {
    claims: BTreeMap<Vec<u8>, String>,
    hints: BTreeMap<Vec<u8>, u32>,
}

impl Pending {
    fn len(&self) -> usize {
        self.claims.len() + self.hints.len()
    }

    fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.hints.is_empty()
    }
}

impl Shard {
    /// Open (or create) shard `index` of a store with `shard_count` shards.
    pub fn open(
        path: impl AsRef<Path>,
        index: usize,
        shard_count: usize,
        options: &ShardOptions,
    ) -> Result<Self> {
        let db = open_db(path.as_ref(), options.cache.as_ref())?;
        validate_or_init_manifest(&db, index, shard_count)?;
        Ok(Self {
            index,
            inner: Mutex::new(ShardInner {
                db,
                pending: Pending::default(),
                compact_on_commit: options.compact_on_commit,
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Bind `target` to `source` unless another source already owns it.
    pub fn claim(&self, repository: &str, target: &str, source: &str) -> Result<ClaimOutcome> {
        let key = encode_key(repository, target);
        let mut inner = self.inner.lock();
        match inner.get_claim(&key)? {
            Some(owner) if owner == source => Ok(ClaimOutcome::OwnedBySelf),
            Some(_) => Ok(ClaimOutcome::OwnedByOther),
            None => {
                inner.pending.claims.insert(key, source.to_string());
                Ok(ClaimOutcome::OwnedBySelf)
            }
        }
    }

    /// Source currently bound to `target`, if any.
    pub fn owner(&self, repository: &str, target: &str) -> Result<Option<String>> {
        let key = encode_key(repository, target);
        self.inner.lock().get_claim(&key)
    }

    pub fn lookup_hint(&self, repository: &str, resolution_key: &str) -> Result<Option<u32>> {
        let key = encode_key(repository, resolution_key);
        self.inner.lock().get_hint(&key)
    }

    pub fn write_hint(&self, repository: &str, resolution_key: &str, iteration: u32) {
        let key = encode_key(repository, resolution_key);
        self.inner.lock().pending.hints.insert(key, iteration);
    }

    /// Write buffered changes to RocksDB. Returns the number of entries
    /// written; zero means nothing was pending.
    ///
    /// On failure the buffered changes are kept so a later commit can retry.
    pub fn commit(&self) -> Result<usize> {
        self.inner.lock().commit(self.index)
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// All claims of `repository` held by this shard, ordered by target.
    pub fn claims(&self, repository: &str) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock();
        let mut merged = BTreeMap::new();
        let prefix = encode_repository_prefix(repository);
        let claims_cf = cf(&inner.db, CF_CLAIMS)?;
        for (key, value) in scan_prefix(&inner.db, claims_cf, &prefix)? {
            merged.insert(decode_suffix(&key, prefix.len())?, decode_string(&value)?);
        }
        for (key, source) in pending_range(&inner.pending.claims, &prefix) {
            merged.insert(decode_suffix(key, prefix.len())?, source.clone());
        }
        Ok(merged.into_iter().collect())
    }

    /// All hints of `repository` held by this shard, ordered by resolution key.
    pub fn hints(&self, repository: &str) -> Result<Vec<(String, u32)>> {
        let inner = self.inner.lock();
        let mut merged = BTreeMap::new();
        let prefix = encode_repository_prefix(repository);
        let hints_cf = cf(&inner.db, CF_HINTS)?;
        for (key, value) in scan_prefix(&inner.db, hints_cf, &prefix)? {
            merged.insert(decode_suffix(&key, prefix.len())?, decode_iteration(&value)?);
        }
        for (key, iteration) in pending_range(&inner.pending.hints, &prefix) {
            merged.insert(decode_suffix(key, prefix.len())?, *iteration);
        }
        Ok(merged.into_iter().collect())
    }
}

impl ShardInner {
    fn get_claim(&self, key: &[u8]) -> Result<Option<String>> {
        if let Some(source) = self.pending.claims.get(key) {
            return Ok(Some(source.clone()));
        }
        let claims_cf = cf(&self.db, CF_CLAIMS)?;
        self.db
            .get_cf(claims_cf, key)?
            .map(|bytes| decode_string(&bytes))
            .transpose()
    }

    fn get_hint(&self, key: &[u8]) -> Result<Option<u32>> {
        if let Some(iteration) = self.pending.hints.get(key) {
            return Ok(Some(*iteration));
        }
        let hints_cf = cf(&self.db, CF_HINTS)?;
        self.db
            .get_cf(hints_cf, key)?
            .map(|bytes| decode_iteration(&bytes))
            .transpose()
    }

    fn commit(&mut self, index: usize) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let claims_cf = cf(&self.db, CF_CLAIMS)?;
        let hints_cf = cf(&self.db, CF_HINTS)?;

        let mut batch = WriteBatch::default();
        for (key, source) in &self.pending.claims {
            batch.put_cf(claims_cf, key, source.as_bytes());
        }
        for (key, iteration) in &self.pending.hints {
            batch.put_cf(hints_cf, key, iteration.to_be_bytes());
        }
        self.db.write(batch)?;
        self.db.flush_cf(claims_cf)?;
        self.db.flush_cf(hints_cf)?;
        if self.compact_on_commit {
            self.db.compact_range_cf::<&[u8], &[u8]>(claims_cf, None, None);
            self.db.compact_range_cf::<&[u8], &[u8]>(hints_cf, None, None);
        }

        let written = self.pending.len();
        self.pending.claims.clear();
        self.pending.hints.clear();
        debug!(shard = index, written, "committed shard");
        Ok(written)
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Err(err) = self.inner.get_mut().commit(self.index) {
            warn!(shard = self.index, error = %err, "failed to commit shard on close");
        }
    }
}

fn open_db(path: &Path, cache: Option<&Cache>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);

    let mut data_options = Options::default();
    if let Some(cache) = cache {
        let mut block_options = BlockBasedOptions::default();
        block_options.set_block_cache(cache);
        data_options.set_block_based_table_factory(&block_options);
    }

    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CLAIMS, data_options.clone()),
        ColumnFamilyDescriptor::new(CF_HINTS, data_options),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| anyhow!("missing column family {name}"))
}

fn validate_or_init_manifest(db: &DB, index: usize, shard_count: usize) -> Result<()> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: ShardManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        if manifest.shard_count as usize != shard_count || manifest.shard_index as usize != index {
            return Err(anyhow!(
                "shard layout mismatch: opened as shard {index} of {shard_count}, \
                 created as shard {} of {}",
                manifest.shard_index,
                manifest.shard_count
            ));
        }
        return Ok(());
    }

    let manifest = ShardManifest {
        format_version: STORAGE_FORMAT_VERSION,
        shard_index: u32::try_from(index)?,
        shard_count: u32::try_from(shard_count)?,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn scan_prefix(db: &DB, cf: &ColumnFamily, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
    let mut entries = Vec::new();
    for entry in db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
        let (key, value) = entry?;
        if !key.starts_with(prefix) {
            break;
        }
        entries.push((key, value));
    }
    Ok(entries)
}

fn pending_range<'a, V>(
    map: &'a BTreeMap<Vec<u8>, V>,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a V)> + 'a {
    map.range(prefix.to_vec()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
}

fn encode_repository_prefix(repository: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + repository.len());
    key.extend_from_slice(&(repository.len() as u32).to_be_bytes());
    key.extend_from_slice(repository.as_bytes());
    key
}

fn encode_key(repository: &str, value: &str) -> Vec<u8> {
    let mut key = encode_repository_prefix(repository);
    key.extend_from_slice(value.as_bytes());
    key
}

fn decode_suffix(key: &[u8], prefix_len: usize) -> Result<String> {
    let suffix = key
        .get(prefix_len..)
        .ok_or_else(|| anyhow!("key shorter than its repository prefix"))?;
    decode_string(suffix)
}

fn decode_string(bytes: &[u8]) -> Result<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn decode_iteration(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| anyhow!("hint value has {} bytes, expected 4", bytes.len()))?;
    Ok(u32::from_be_bytes(raw))
}
