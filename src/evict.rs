//! Approximate LRU eviction over the sharded layout.  Rather than
//! scanning the whole cache, each eviction looks at a single random
//! shard and deletes the file in there with the oldest access time.
//! With keys from a cryptographic hash, shards fill evenly, so a
//! random shard of a full cache almost always has a victim.
//!
//! When the random shard is empty (small or nearly empty caches),
//! we fall back to the non-empty shards, least recently accessed
//! first, until one of them yields a victim.
//!
//! We rely on the filesystem to maintain access times; `relatime`
//! is good enough: it updates `atime` at least on the first read
//! after each write, and once a day.
use std::fs::DirEntry;
use std::fs::Metadata;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use filetime::FileTime;

use crate::error::is_absent_file_error;
use crate::layout;

/// Temporary files end with this suffix; eviction never picks them.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Delete temporary files with mtime older than this age: only a
/// crashed writer leaves them behind.
#[cfg(not(test))]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(3600);

// We want a more eager timeout in tests.
#[cfg(test)]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(2);

/// Returns the number of bytes we charge to the cache's total size for
/// a file: its allocated size, or its logical size if larger (e.g.,
/// filesystems that inline tiny files report zero blocks).
pub(crate) fn disk_usage(meta: &Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        (meta.blocks() * 512).max(meta.len())
    }

    #[cfg(not(unix))]
    {
        meta.len()
    }
}

/// Removes a file if it exists.
pub(crate) fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// What we know about an eviction candidate.
struct Candidate {
    entry: DirEntry,
    atime: FileTime,
    usage: u64,
}

fn is_temp_name(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}

/// Deletes `entry` if it is a temporary file older than
/// `MAX_TEMP_FILE_AGE`.  Errors are ignored: a concurrent writer may
/// rename it away at any time.
fn maybe_sweep_temp_file(entry: &DirEntry, meta: &Metadata, threshold: Option<SystemTime>) {
    let threshold = match threshold {
        Some(time) => time,
        None => return,
    };

    if let Ok(mtime) = meta.modified() {
        if mtime < threshold && ensure_file_removed(&entry.path()).is_ok() {
            tracing::debug!(path = %entry.path().display(), "deleted stale temporary file");
        }
    }
}

/// Finds the regular, non-temporary file with the oldest access time
/// directly under `dir`.  Deletes stale temporary files on the way.
///
/// Returns `Ok(None)` if `dir` has no candidate.
fn choose_lru_file(dir: &Path) -> Result<Option<Candidate>> {
    let threshold = SystemTime::now().checked_sub(MAX_TEMP_FILE_AGE);
    let mut best: Option<Candidate> = None;

    for maybe_entry in std::fs::read_dir(dir)? {
        let entry = match maybe_entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // Evicted or renamed by someone else since `readdir`.
            Err(e) if is_absent_file_error(&e) => continue,
            Err(e) => return Err(e),
        };

        if !meta.is_file() {
            continue;
        }

        if is_temp_name(&entry.file_name().to_string_lossy()) {
            maybe_sweep_temp_file(&entry, &meta, threshold);
            continue;
        }

        let atime = FileTime::from_last_access_time(&meta);
        if best.as_ref().map_or(true, |b| atime < b.atime) {
            best = Some(Candidate {
                entry,
                atime,
                usage: disk_usage(&meta),
            });
        }
    }

    Ok(best)
}

/// Deletes the least recently accessed file in `dir`, and returns the
/// number of bytes freed (0 if we found nothing to delete).
pub(crate) fn unlink_lru_file(dir: &Path) -> u64 {
    let victim = match choose_lru_file(dir) {
        Ok(Some(victim)) => victim,
        Ok(None) => return 0,
        Err(e) => {
            if !is_absent_file_error(&e) {
                tracing::debug!(dir = %dir.display(), "failed to scan shard: {}", e);
            }
            return 0;
        }
    };

    match std::fs::remove_file(victim.entry.path()) {
        Ok(()) => victim.usage,
        // Another evictor beat us to it; it gets to account for the
        // deletion.
        Err(e) if is_absent_file_error(&e) => 0,
        Err(e) => {
            tracing::debug!(path = %victim.entry.path().display(), "failed to evict: {}", e);
            0
        }
    }
}

/// Returns whether `dir` has at least one directory entry.
fn is_non_empty_dir(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// Lists the non-empty shard directories under `root`, least recently
/// accessed first.
fn shards_by_atime(root: &Path) -> Result<Vec<PathBuf>> {
    let mut shards = Vec::new();

    for entry in std::fs::read_dir(root)?.flatten() {
        let name = entry.file_name();
        if !layout::is_shard_name(&name.to_string_lossy()) {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) if meta.is_dir() => meta,
            _ => continue,
        };

        let path = entry.path();
        if is_non_empty_dir(&path) {
            shards.push((FileTime::from_last_access_time(&meta), path));
        }
    }

    shards.sort();
    Ok(shards.into_iter().map(|(_, path)| path).collect())
}

/// Evicts one entry from the cache under `root`, starting with shard
/// `random_shard`, and returns the number of bytes freed.  The caller
/// is responsible for updating the cache's size counter.
///
/// Returns 0 if there is nothing left to evict (or every attempt lost
/// a race with a concurrent evictor).
pub(crate) fn evict_random_or_lru(root: &Path, random_shard: u8) -> u64 {
    let freed = unlink_lru_file(&root.join(layout::shard_name(random_shard)));
    if freed > 0 {
        return freed;
    }

    let shards = match shards_by_atime(root) {
        Ok(shards) => shards,
        Err(e) => {
            tracing::debug!(root = %root.display(), "failed to list shards: {}", e);
            return 0;
        }
    };

    // Keep going until something actually gets deleted: a shard may
    // only contain temporary files, or lose every file to concurrent
    // evictors while we scan it.
    for shard in shards {
        let freed = unlink_lru_file(&shard);
        if freed > 0 {
            return freed;
        }
    }

    0
}

#[cfg(test)]
mod test {
    use super::*;
    use test_dir::{DirBuilder, FileType, TestDir};

    fn set_atime(path: &Path, seconds: i64) {
        filetime::set_file_atime(path, FileTime::from_unix_time(seconds, 0))
            .expect("set_file_atime must succeed");
    }

    fn exists(path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    #[test]
    fn test_remove_file() {
        let temp = TestDir::temp().create("cache_file", FileType::ZeroFile(10));

        let path = temp.path("cache_file");
        assert!(ensure_file_removed(&path).is_ok());
        assert!(!exists(&path));

        // Removing a file that does not exist is ok.
        assert!(ensure_file_removed(&path).is_ok());
    }

    #[test]
    fn test_disk_usage_covers_length() {
        let temp = TestDir::temp().create("file", FileType::RandomFile(10_000));

        let meta = std::fs::metadata(temp.path("file")).expect("metadata must succeed");
        assert!(disk_usage(&meta) >= 10_000);
    }

    /// The oldest atime loses, regardless of directory order; temp
    /// files and subdirectories are never candidates.
    #[test]
    fn test_unlink_lru_file() {
        let temp = TestDir::temp()
            .create("aa", FileType::Dir)
            .create("aa/new", FileType::RandomFile(100))
            .create("aa/old", FileType::RandomFile(100))
            .create("aa/mid", FileType::RandomFile(100))
            .create("aa/older.x.tmp", FileType::RandomFile(100))
            .create("aa/subdir", FileType::Dir);

        set_atime(&temp.path("aa/new"), 3000);
        set_atime(&temp.path("aa/old"), 1000);
        set_atime(&temp.path("aa/mid"), 2000);
        set_atime(&temp.path("aa/older.x.tmp"), 10);

        let freed = unlink_lru_file(&temp.path("aa"));
        assert!(freed >= 100);
        assert!(!exists(&temp.path("aa/old")));
        assert!(exists(&temp.path("aa/new")));
        assert!(exists(&temp.path("aa/mid")));
        assert!(exists(&temp.path("aa/subdir")));

        assert!(unlink_lru_file(&temp.path("aa")) > 0);
        assert!(!exists(&temp.path("aa/mid")));

        assert!(unlink_lru_file(&temp.path("aa")) > 0);
        assert!(!exists(&temp.path("aa/new")));

        // Only the temporary file and the subdirectory are left.
        assert_eq!(unlink_lru_file(&temp.path("aa")), 0);
        assert!(exists(&temp.path("aa/subdir")));
    }

    #[test]
    fn test_unlink_missing_dir() {
        let temp = TestDir::temp();

        assert_eq!(unlink_lru_file(&temp.path("absent")), 0);
    }

    /// Old temporary files get deleted while we scan for victims.
    #[test]
    fn test_sweeps_stale_temp_files() {
        let temp = TestDir::temp()
            .create("aa", FileType::Dir)
            .create("aa/entry.abc.tmp", FileType::ZeroFile(10));

        // Fresh temp files are left alone.
        assert_eq!(unlink_lru_file(&temp.path("aa")), 0);
        assert!(exists(&temp.path("aa/entry.abc.tmp")));

        std::thread::sleep(Duration::from_secs_f64(2.5));
        assert_eq!(unlink_lru_file(&temp.path("aa")), 0);
        assert!(!exists(&temp.path("aa/entry.abc.tmp")));
    }

    /// When the random shard is empty, we fall back to the least
    /// recently accessed non-empty shard.
    #[test]
    fn test_fallback_to_lru_shard() {
        let temp = TestDir::temp()
            .create("00", FileType::Dir)
            .create("1f", FileType::Dir)
            .create("1f/entry", FileType::RandomFile(100))
            .create("2e", FileType::Dir)
            .create("2e/entry", FileType::RandomFile(100))
            // Not a shard.
            .create("zz", FileType::Dir)
            .create("zz/entry", FileType::RandomFile(100));

        set_atime(&temp.path("1f"), 2000);
        set_atime(&temp.path("2e"), 1000);
        set_atime(&temp.path("zz"), 10);

        assert!(evict_random_or_lru(&temp.path("."), 0x00) > 0);
        assert!(exists(&temp.path("1f/entry")));
        assert!(!exists(&temp.path("2e/entry")));
        assert!(exists(&temp.path("zz/entry")));
    }

    /// The random shard wins when it has a victim.
    #[test]
    fn test_random_shard_first() {
        let temp = TestDir::temp()
            .create("1f", FileType::Dir)
            .create("1f/entry", FileType::RandomFile(100))
            .create("2e", FileType::Dir)
            .create("2e/entry", FileType::RandomFile(100));

        set_atime(&temp.path("1f/entry"), 5000);
        set_atime(&temp.path("2e/entry"), 1000);

        assert!(evict_random_or_lru(&temp.path("."), 0x1f) > 0);
        assert!(!exists(&temp.path("1f/entry")));
        assert!(exists(&temp.path("2e/entry")));
    }

    /// A shard with only temporary files doesn't stop the fallback
    /// from finding a victim elsewhere.
    #[test]
    fn test_fallback_skips_shards_without_victims() {
        let temp = TestDir::temp()
            .create("01", FileType::Dir)
            .create("01/entry.abc.tmp", FileType::RandomFile(100))
            .create("02", FileType::Dir)
            .create("02/entry", FileType::RandomFile(100));

        set_atime(&temp.path("01"), 1000);
        set_atime(&temp.path("02"), 2000);

        assert!(evict_random_or_lru(&temp.path("."), 0xff) > 0);
        assert!(exists(&temp.path("01/entry.abc.tmp")));
        assert!(!exists(&temp.path("02/entry")));
    }

    #[test]
    fn test_evict_empty_cache() {
        let temp = TestDir::temp().create("00", FileType::Dir);

        assert_eq!(evict_random_or_lru(&temp.path("."), 0x00), 0);
        assert_eq!(evict_random_or_lru(&temp.path("absent"), 0x00), 0);
    }
}
