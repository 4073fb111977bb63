//! A `DiskStore` is the file-backed half of a [`crate::Cache`]: the
//! cache root directory, its mapped index, and the parameters every
//! reader and writer needs.  It is shared (behind an `Arc`) between
//! the cache handle and the background writers.
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use crate::error::is_absent_file_error;
use crate::evict;
use crate::index::IndexStore;
use crate::index::INDEX_FILE_NAME;
use crate::layout;
use crate::CacheKey;
use crate::DriverIdentity;
use crate::Result;

#[derive(Debug)]
pub(crate) struct DiskStore {
    root: PathBuf,
    index: IndexStore,
    identity: DriverIdentity,
    // Soft limit on the cache's total size, in bytes.
    max_size: u64,
    // Picks random shards for eviction.  Seeded once per store.
    rng: Mutex<SmallRng>,
}

impl DiskStore {
    /// Opens (or initialises) the cache rooted at `root`, which must
    /// already exist.
    pub fn open(root: PathBuf, identity: DriverIdentity, max_size: u64) -> Result<DiskStore> {
        let index = IndexStore::open(&root.join(INDEX_FILE_NAME))?;

        Ok(DiskStore {
            root,
            index,
            identity,
            max_size,
            rng: Mutex::new(SmallRng::from_entropy()),
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    #[inline]
    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    #[inline]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Returns whether storing `incoming` more bytes would exceed the
    /// size limit.
    pub fn over_budget(&self, incoming: u64) -> bool {
        self.index.get_size().saturating_add(incoming) > self.max_size
    }

    /// Evicts one (approximately least recently used) entry and
    /// returns the number of bytes freed.
    pub fn evict_one(&self) -> u64 {
        let shard: u8 = self.rng.lock().gen();
        let freed = evict::evict_random_or_lru(&self.root, shard);

        if freed > 0 {
            self.index.sub_size(freed);
        }

        tracing::debug!(shard, freed, "evicted cache entry");
        freed
    }

    /// Deletes the entry for `key`, if any.
    ///
    /// The entry is first renamed to a private temporary name in its
    /// shard, and only that file is measured and unlinked: a new entry
    /// published concurrently under the same key is never deleted
    /// without being credited back.
    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = layout::path_for(&self.root, key);
        let suffix: u64 = self.rng.lock().gen();
        let doomed = path.with_file_name(format!(
            "{}.{:016x}{}",
            layout::entry_name(key),
            suffix,
            evict::TEMP_SUFFIX
        ));

        match std::fs::rename(&path, &doomed) {
            Ok(()) => {}
            // Someone else deleted (and accounted for) it first.
            Err(e) if is_absent_file_error(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let usage = std::fs::symlink_metadata(&doomed)
            .map(|meta| evict::disk_usage(&meta))
            .unwrap_or(0);
        self.index.sub_size(usage);

        // If this fails, the stale temp sweep deletes the file later.
        if let Err(e) = std::fs::remove_file(&doomed) {
            tracing::debug!(path = %doomed.display(), error = %e, "failed to delete removed entry");
        }

        Ok(())
    }
}
