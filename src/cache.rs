//! The `Cache` is the public handle: it owns the disk store (if the
//! cache directory could be set up), the background put queue, and
//! optional host-provided storage callbacks that replace the disk
//! store entirely.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use derivative::Derivative;

use crate::config::resolve_cache_dir;
use crate::config::CacheConfig;
use crate::config::DirInputs;
use crate::queue::PutJob;
use crate::queue::PutQueue;
use crate::reader;
use crate::store::DiskStore;
use crate::CacheKey;
use crate::DriverIdentity;
use crate::Entry;
use crate::EntryMetadata;
use crate::Error;
use crate::Result;

/// Host callback that stores `data` under `key`.
pub type BlobPutFn = dyn Fn(&CacheKey, &[u8]) + Send + Sync;

/// Host callback that returns the data stored under `key`, if any.
/// An empty value is a miss.
pub type BlobGetFn = dyn Fn(&CacheKey) -> Option<Vec<u8>> + Send + Sync;

struct BlobCallbacks {
    put: Box<BlobPutFn>,
    get: Box<BlobGetFn>,
}

/// Construct a [`Cache`] with this builder.  Building never fails:
/// when the cache directory can't be set up, the resulting cache is
/// disabled, and all its operations are no-ops or misses.
#[derive(Clone, Debug)]
pub struct CacheBuilder {
    identity: DriverIdentity,
    config: CacheConfig,
    // Read from the process environment at build time when `None`.
    dir_inputs: Option<DirInputs>,
}

/// A handle to a disk cache directory, for one driver identity.
///
/// Dropping the cache waits for every pending put to complete.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Cache {
    identity: DriverIdentity,
    // `None` when disabled.
    disk: Option<Arc<DiskStore>>,
    queue: Option<PutQueue>,
    #[derivative(Debug = "ignore")]
    callbacks: Option<BlobCallbacks>,
}

impl CacheBuilder {
    /// Returns a builder for a cache with the default configuration
    /// (see [`CacheConfig::default`]), namespaced by the driver
    /// identity for `producer_id`, `target_id`, and `feature_flags`.
    pub fn new(producer_id: &str, target_id: &str, feature_flags: u64) -> Self {
        CacheBuilder {
            identity: DriverIdentity::new(producer_id, target_id, feature_flags),
            config: CacheConfig::default(),
            dir_inputs: None,
        }
    }

    /// Stores the cache directly in `path`, instead of a directory
    /// resolved from [`DirInputs`].  `path` is created if missing.
    ///
    /// Without this, the root is always resolved from
    /// `$SHADER_CACHE_DIR`, `$XDG_CACHE_HOME` or the home directory
    /// (unless [`CacheBuilder::dir_inputs`] says otherwise), whether
    /// or not [`CacheBuilder::from_env`] is called.
    pub fn directory(mut self, path: impl AsRef<Path>) -> Self {
        self.config.directory = Some(path.as_ref().to_owned());
        self
    }

    /// Sets the soft size limit, in bytes.
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.config.max_size = max_size;
        self
    }

    /// Sets the number of background writer threads.  Zero means one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Applies the environment's size limit and disable switch.  See
    /// [`CacheConfig::apply_env`].
    ///
    /// The cache directory is resolved separately, see
    /// [`CacheBuilder::directory`].
    pub fn from_env(mut self) -> Self {
        self.config.apply_env();
        self
    }

    /// Resolves the cache root from `inputs` instead of the process
    /// environment.  Has no effect after [`CacheBuilder::directory`].
    pub fn dir_inputs(mut self, inputs: DirInputs) -> Self {
        self.dir_inputs = Some(inputs);
        self
    }

    /// Returns the configuration the cache will be built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn open_disk(&self) -> Result<(Arc<DiskStore>, PutQueue)> {
        let root = match &self.config.directory {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => match &self.dir_inputs {
                Some(inputs) => resolve_cache_dir(inputs)?,
                None => resolve_cache_dir(&DirInputs::from_env())?,
            },
        };

        let store = Arc::new(DiskStore::open(
            root,
            self.identity.clone(),
            self.config.max_size,
        )?);
        let queue = PutQueue::new(store.clone(), self.config.workers)?;
        Ok((store, queue))
    }

    pub fn build(self) -> Cache {
        let (disk, queue) = if !self.config.enabled {
            (None, None)
        } else {
            match self.open_disk() {
                Ok((disk, queue)) => (Some(disk), Some(queue)),
                Err(e) => {
                    tracing::warn!(
                        directory = ?self.config.directory,
                        error = %e,
                        "failed to initialise disk cache; disabling it"
                    );
                    (None, None)
                }
            }
        };

        Cache {
            identity: self.identity,
            disk,
            queue,
            callbacks: None,
        }
    }
}

impl Cache {
    /// Creates a cache for this driver identity, configured from the
    /// environment.
    pub fn create(producer_id: &str, target_id: &str, feature_flags: u64) -> Cache {
        CacheBuilder::new(producer_id, target_id, feature_flags)
            .from_env()
            .build()
    }

    #[inline]
    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    /// Returns whether the cache is backed by a directory.
    pub fn is_enabled(&self) -> bool {
        self.disk.is_some()
    }

    /// Returns the cache's root directory, if enabled.
    pub fn path(&self) -> Option<&Path> {
        self.disk.as_ref().map(|disk| disk.root())
    }

    /// Returns the soft size limit, or 0 if disabled.
    pub fn max_size(&self) -> u64 {
        self.disk.as_ref().map_or(0, |disk| disk.max_size())
    }

    /// Returns the (approximate) total size of the cache directory,
    /// shared by all the processes that use it.
    pub fn size(&self) -> u64 {
        self.disk.as_ref().map_or(0, |disk| disk.index().get_size())
    }

    /// Derives the cache key for `data` under this cache's driver
    /// identity.
    pub fn compute_key(&self, data: &[u8]) -> CacheKey {
        self.identity.compute_key(data)
    }

    /// Returns the path where the entry for `key` would live.
    pub fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.disk
            .as_ref()
            .map(|disk| crate::layout::path_for(disk.root(), key))
    }

    /// Replaces the disk store with host-provided storage.
    pub fn set_callbacks(
        &mut self,
        put: impl Fn(&CacheKey, &[u8]) + Send + Sync + 'static,
        get: impl Fn(&CacheKey) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.callbacks = Some(BlobCallbacks {
            put: Box::new(put),
            get: Box::new(get),
        });
    }

    /// Schedules a write of `data` (and `metadata`) for `key`.  Returns
    /// immediately; write failures are logged and otherwise ignored.
    pub fn put(&self, key: &CacheKey, data: &[u8], metadata: Option<&EntryMetadata>) {
        if let Some(callbacks) = &self.callbacks {
            (callbacks.put)(key, data);
            return;
        }

        if let Some(queue) = &self.queue {
            queue.submit(PutJob {
                key: *key,
                data: data.to_vec(),
                metadata: metadata.cloned(),
            });
        }
    }

    /// Returns the data stored for `key`, or `None` on miss.  Corrupt
    /// entries are misses.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.get_entry(key).map(|entry| entry.data)
    }

    /// Like [`Cache::get`], but also returns the entry's metadata.
    pub fn get_entry(&self, key: &CacheKey) -> Option<Entry> {
        if let Some(callbacks) = &self.callbacks {
            return (callbacks.get)(key)
                .filter(|data| !data.is_empty())
                .map(|data| Entry {
                    data,
                    metadata: None,
                });
        }

        match self.try_get_entry(key) {
            Ok(entry) => entry,
            Err(Error::IdentityMismatch) => {
                tracing::error!(
                    %key,
                    identity = ?self.identity,
                    "cache entry was written under another driver identity: key hash collision"
                );
                None
            }
            Err(e) if e.is_corruption() => {
                tracing::warn!(%key, error = %e, "ignoring corrupt cache entry");
                None
            }
            Err(e) => {
                tracing::debug!(%key, error = %e, "failed to read cache entry");
                None
            }
        }
    }

    /// Returns the data stored for `key`, distinguishing misses
    /// (`Ok(None)`) from failures.  Ignores storage callbacks.
    pub fn try_get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.try_get_entry(key)?.map(|entry| entry.data))
    }

    /// Like [`Cache::try_get`], but also returns the entry's metadata.
    pub fn try_get_entry(&self, key: &CacheKey) -> Result<Option<Entry>> {
        match &self.disk {
            Some(disk) => reader::read_entry(disk, key),
            None => Ok(None),
        }
    }

    /// Records `key` as present, without any data.
    pub fn put_key(&self, key: &CacheKey) {
        if let Some(callbacks) = &self.callbacks {
            (callbacks.put)(key, &key.as_bytes()[..4]);
            return;
        }

        if let Some(disk) = &self.disk {
            disk.index().put_key(key);
        }
    }

    /// Returns whether `key` was recently stored.  This is a hint: a
    /// `true` may still be followed by a miss in [`Cache::get`].
    pub fn has_key(&self, key: &CacheKey) -> bool {
        if let Some(callbacks) = &self.callbacks {
            return (callbacks.get)(key).map_or(false, |data| !data.is_empty());
        }

        self.disk
            .as_ref()
            .map_or(false, |disk| disk.index().has_key(key))
    }

    /// Deletes the entry for `key`, if any.
    pub fn remove(&self, key: &CacheKey) {
        if self.callbacks.is_some() {
            return;
        }

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove(key) {
                tracing::debug!(%key, error = %e, "failed to remove cache entry");
            }
        }
    }

    /// Blocks until every put scheduled so far has completed.
    pub fn wait_for_idle(&self) {
        if let Some(queue) = &self.queue {
            queue.wait_for_idle();
        }
    }
}
