//! `shader_disk_cache` implements a persistent, size-bounded,
//! multiprocess cache for compiled artifact blobs (e.g., shader
//! binaries), keyed by 20-byte SHA-1 digests and stored in a
//! filesystem directory.  Any number of threads and processes may
//! share the same cache directory without explicit locking: writers
//! publish complete files with atomic renames, and the only shared
//! mutable state is a small memory-mapped index file updated with
//! atomic instructions.
//!
//! Keys are salted with a [`DriverIdentity`], a fingerprint of the
//! producer's configuration (producer and target ids, pointer width,
//! feature flags).  Every entry also starts with a copy of that
//! identity, so a reader detects the (astronomically unlikely) case
//! of a key computed under another configuration that hashes to the
//! same digest.
//!
//! Writes are asynchronous: [`Cache::put`] copies the data to a queue
//! serviced by a few low-priority background threads, which compress
//! the payload, make room in the cache if needed, and publish the
//! entry.  Reads are synchronous, and validate each entry's length
//! and CRC-32 checksum: corrupt or truncated entries are reported as
//! misses, never as wrong data.
//!
//! The size limit is soft.  Each write performs a bounded number of
//! evictions before storing its entry, but stores it regardless; the
//! cache may temporarily exceed its limit under concurrent writes.
//! Eviction approximates LRU: pick a random shard, and delete its
//! file with the oldest access time.  The shared size counter is only
//! approximately consistent with the directory contents, since
//! processes may be killed between writing a file and updating the
//! counter.
//!
//! Reads never fail loudly.  The convenience accessors ([`Cache::get`],
//! [`Cache::put`], ...) swallow errors into misses and no-ops (logged
//! via [`tracing`]); [`Cache::try_get`] surfaces them as [`Error`]s.
//! If the cache directory can't be set up at all, the [`Cache`] is
//! simply disabled: every put is a no-op and every get a miss.
//!
//! # Sample usage
//!
//! ```no_run
//! let cache = shader_disk_cache::CacheBuilder::new("my-compiler 1.2.3", "gfx1030", 0x5)
//!     .directory("/tmp/shader_cache")
//!     .max_size(256 << 20)
//!     .build();
//!
//! let key = cache.compute_key(b"shader source and compile options");
//! if cache.get(&key).is_none() {
//!     let binary: Vec<u8> = // ... expensive compilation ...
//!         # Vec::new();
//!     cache.put(&key, &binary, None);
//! }
//! ```
//!
//! # Cache directory structure
//!
//! ```text
//! $root/index                 shared size counter and key table
//! $root/$XX/$YYYY...          entry for key XXYYYY... (40 hex digits)
//! $root/$XX/$YYYY....$R.tmp   in-flight (or crashed) write
//! ```
//!
//! Entries are sharded in 256 subdirectories on the first byte of the
//! key.  Entry files are published read-only; it's always safe to
//! delete them (or the whole cache directory) behind the cache's back,
//! although the size counter will then overestimate the cache's size
//! until evictions catch up.
mod cache;
pub mod codec;
pub mod config;
mod entry;
mod error;
mod evict;
mod identity;
mod index;
mod layout;
mod queue;
mod reader;
mod store;
mod writer;

pub use cache::BlobGetFn;
pub use cache::BlobPutFn;
pub use cache::Cache;
pub use cache::CacheBuilder;
pub use entry::Entry;
pub use entry::EntryMetadata;
pub use error::Error;
pub use error::Result;
pub use identity::DriverIdentity;
pub use identity::CACHE_FORMAT_VERSION;

/// Cache keys are SHA-1 digests.
pub const CACHE_KEY_SIZE: usize = 20;

/// A 20-byte cache key, usually derived with
/// [`DriverIdentity::compute_key`] or [`Cache::compute_key`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; CACHE_KEY_SIZE]);

impl CacheKey {
    #[inline]
    pub const fn from_bytes(bytes: [u8; CACHE_KEY_SIZE]) -> CacheKey {
        CacheKey(bytes)
    }

    /// Fails with `InvalidKeyLength` unless `bytes` is exactly
    /// `CACHE_KEY_SIZE` long.
    pub fn from_slice(bytes: &[u8]) -> Result<CacheKey> {
        if bytes.len() != CACHE_KEY_SIZE {
            return Err(Error::InvalidKeyLength(bytes.len()));
        }

        let mut ret = [0u8; CACHE_KEY_SIZE];
        ret.copy_from_slice(bytes);
        Ok(CacheKey(ret))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; CACHE_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; CACHE_KEY_SIZE]> for CacheKey {
    fn from(bytes: [u8; CACHE_KEY_SIZE]) -> CacheKey {
        CacheKey(bytes)
    }
}

impl AsRef<[u8]> for CacheKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

#[test]
fn test_key_from_slice() {
    let bytes: Vec<u8> = (0..CACHE_KEY_SIZE as u8).collect();
    let key = CacheKey::from_slice(&bytes).expect("20 bytes must be accepted");

    assert_eq!(&key.as_bytes()[..], &bytes[..]);
    assert_eq!(key.to_hex(), "000102030405060708090a0b0c0d0e0f10111213");
    assert_eq!(format!("{}", key), key.to_hex());
    assert_eq!(
        format!("{:?}", key),
        "CacheKey(000102030405060708090a0b0c0d0e0f10111213)"
    );

    assert!(matches!(
        CacheKey::from_slice(&bytes[1..]),
        Err(Error::InvalidKeyLength(19))
    ));
    assert!(matches!(
        CacheKey::from_slice(&[0u8; 21]),
        Err(Error::InvalidKeyLength(21))
    ));
}
