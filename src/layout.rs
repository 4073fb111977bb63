//! Cache directories are sharded on the first byte of each key:
//! `$root/$hex(key[0])/$hex(key[1..])`.  That bounds directory sizes
//! at 1/256th of the cache, and gives eviction a cheap random entry
//! point (pick a byte, look in that one shard).
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;

use crate::CacheKey;

/// Returns the shard subdirectory name for shard `id`.
#[inline]
pub(crate) fn shard_name(id: u8) -> String {
    format!("{:02x}", id)
}

/// Returns whether a directory entry name looks like a shard.
#[inline]
pub(crate) fn is_shard_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns the path of the shard directory for `key` under `root`.
pub(crate) fn shard_dir(root: &Path, key: &CacheKey) -> PathBuf {
    root.join(shard_name(key.as_bytes()[0]))
}

/// Returns the entry file name for `key`, within its shard.
pub(crate) fn entry_name(key: &CacheKey) -> String {
    hex::encode(&key.as_bytes()[1..])
}

/// Returns the path of the entry file for `key` under `root`.
pub(crate) fn path_for(root: &Path, key: &CacheKey) -> PathBuf {
    let mut path = shard_dir(root, key);

    path.push(entry_name(key));
    path
}

/// Creates `path` as a directory if it does not already exist.
///
/// Losing a creation race to another process is not an error, but an
/// existing non-directory at `path` is.
pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if std::fs::metadata(path)?.is_dir() {
                Ok(())
            } else {
                Err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", path.display()),
                ))
            }
        }
        Err(e) => Err(e),
    }
}

#[test]
fn test_path_for() {
    let mut bytes = [0u8; crate::CACHE_KEY_SIZE];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = i as u8 * 13;
    }
    bytes[0] = 0xab;
    let key = CacheKey::from_bytes(bytes);

    let path = path_for(Path::new("/cache"), &key);
    let name = entry_name(&key);

    assert_eq!(name.len(), 38);
    assert_eq!(path, Path::new("/cache/ab").join(&name));
    assert_eq!(name, hex::encode(&bytes[1..]));
}

#[test]
fn test_shard_names() {
    assert_eq!(shard_name(0), "00");
    assert_eq!(shard_name(0x0f), "0f");
    assert_eq!(shard_name(0xff), "ff");

    assert!(is_shard_name("00"));
    assert!(is_shard_name("a9"));
    assert!(!is_shard_name(".."));
    assert!(!is_shard_name("abc"));
    assert!(!is_shard_name("zz"));
    assert!(!is_shard_name("index"));
}

#[test]
fn test_ensure_dir() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("file", FileType::ZeroFile(1));

    let dir = temp.path("shard");
    ensure_dir(&dir).expect("creation must succeed");
    assert!(dir.is_dir());

    // Idempotent.
    ensure_dir(&dir).expect("second call must succeed");

    // But files are in the way.
    assert!(ensure_dir(&temp.path("file")).is_err());
    // And we don't create intermediate directories.
    assert!(ensure_dir(&temp.path("missing/shard")).is_err());
}
