//! The index is a small file mapped shared by every process that uses
//! the same cache directory.  It holds the cache's total size, and a
//! direct-mapped table of recently stored keys that answers "have we
//! seen this key?" without any syscall.
//!
//! Layout (no padding, native endianness):
//!
//! ```text
//! offset 0        u64 total size, only ever accessed atomically
//! offset 8        NUM_SLOTS x 20-byte keys
//! ```
//!
//! The size counter is the only field that needs cross-process
//! atomicity.  Key slots are written without synchronisation: two
//! processes may interleave their writes to the same slot, and the
//! result is a slot that matches neither key.  That's a spurious
//! `has_key` miss, never a wrong hit on disk data: the table is only
//! a hint.  We still go through relaxed atomic words, so that the
//! race is well-defined in Rust's memory model.
//!
//! All processes sharing a cache must agree on endianness; we don't
//! byte-swap the counter.
use std::fs::OpenOptions;
use std::io::Result;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use memmap2::MmapMut;

use crate::CacheKey;
use crate::CACHE_KEY_SIZE;

pub(crate) const INDEX_KEY_BITS: u32 = 16;
pub(crate) const NUM_SLOTS: usize = 1 << INDEX_KEY_BITS;

const SIZE_FIELD_LEN: usize = std::mem::size_of::<u64>();
const WORDS_PER_KEY: usize = CACHE_KEY_SIZE / 4;

/// Exact byte length of an index file.
pub(crate) const INDEX_FILE_SIZE: usize = SIZE_FIELD_LEN + NUM_SLOTS * CACHE_KEY_SIZE;

/// Name of the index file in the cache root directory.
pub(crate) const INDEX_FILE_NAME: &str = "index";

/// A read-write shared mapping of an index file.
pub(crate) struct IndexStore {
    // Base address of `map`'s memory, derived from a mutable borrow
    // once at open time: all accesses go through atomics at offsets
    // computed from this pointer.
    base: NonNull<u8>,
    // Keeps the mapping alive; dropping it unmaps.
    map: MmapMut,
}

// Every access to the mapped bytes goes through atomics, and the
// mapping itself lives as long as `self`.
unsafe impl Send for IndexStore {}
unsafe impl Sync for IndexStore {}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("len", &self.map.len())
            .field("size", &self.get_size())
            .finish()
    }
}

/// Returns the slot for `key`: the low bits of its first 32-bit word.
#[inline]
fn slot_of(key: &CacheKey) -> usize {
    let bytes = key.as_bytes();
    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    (word as usize) & (NUM_SLOTS - 1)
}

/// Splits `key` in native-endian words, so that storing the words
/// reproduces the key's byte sequence in the mapping.
#[inline]
fn key_words(key: &CacheKey) -> [u32; WORDS_PER_KEY] {
    let mut words = [0u32; WORDS_PER_KEY];

    for (word, chunk) in words.iter_mut().zip(key.as_bytes().chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    words
}

impl IndexStore {
    /// Opens or creates the index file at `path`, forces it to the
    /// expected size, and maps it shared.
    pub fn open(path: &Path) -> Result<IndexStore> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        // A wrong size means a different index layout, or a file
        // truncated by a crash.  Its contents are meaningless: truncate
        // to zero before growing, so that the counter and every slot
        // start out cleared.
        if file.metadata()?.len() != INDEX_FILE_SIZE as u64 {
            file.set_len(0)?;
            file.set_len(INDEX_FILE_SIZE as u64)?;
        }

        // Safety: the mapping is shared with other processes by
        // design; we never create references to plain (non-atomic)
        // data in it.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() != INDEX_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "index mapping has unexpected length",
            ));
        }

        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "null index mapping")
        })?;

        Ok(IndexStore { base, map })
    }

    #[inline]
    fn size_counter(&self) -> &AtomicU64 {
        // Safety: mappings are page-aligned, so offset 0 is suitably
        // aligned for a u64, and the mapping is at least 8 bytes long.
        unsafe { &*(self.base.as_ptr() as *const AtomicU64) }
    }

    #[inline]
    fn slot_words(&self, slot: usize) -> &[AtomicU32] {
        debug_assert!(slot < NUM_SLOTS);

        // Safety: slots start at offset 8 and are 20 bytes each, so
        // every slot is 4-byte aligned, and `slot < NUM_SLOTS` keeps
        // the slice within the mapping.
        unsafe {
            let start = self
                .base
                .as_ptr()
                .add(SIZE_FIELD_LEN + slot * CACHE_KEY_SIZE);
            std::slice::from_raw_parts(start as *const AtomicU32, WORDS_PER_KEY)
        }
    }

    /// Atomically adds `delta` (which may be negative) to the total size.
    pub fn add_size(&self, delta: i64) {
        // Two's complement wrapping addition handles negative deltas.
        self.size_counter()
            .fetch_add(delta as u64, Ordering::Relaxed);
    }

    /// Atomically subtracts `delta` from the total size, saturating at
    /// zero: deleting an entry that another process never accounted
    /// for (e.g., after the index was recreated) must not wrap around.
    pub fn sub_size(&self, delta: u64) {
        let counter = self.size_counter();
        let mut current = counter.load(Ordering::Relaxed);

        loop {
            let next = current.saturating_sub(delta);
            match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get_size(&self) -> u64 {
        self.size_counter().load(Ordering::Relaxed)
    }

    /// Records `key` in its slot, overwriting whatever was there.
    pub fn put_key(&self, key: &CacheKey) {
        for (dst, word) in self.slot_words(slot_of(key)).iter().zip(key_words(key)) {
            dst.store(word, Ordering::Relaxed);
        }
    }

    /// Returns whether `key` currently occupies its slot.  A hit is a
    /// strong hint, not a guarantee, that the entry exists on disk.
    pub fn has_key(&self, key: &CacheKey) -> bool {
        self.slot_words(slot_of(key))
            .iter()
            .zip(key_words(key))
            .all(|(slot, word)| slot.load(Ordering::Relaxed) == word)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;
    use test_dir::{DirBuilder, FileType, TestDir};

    fn key_with_prefix(prefix: [u8; 4], fill: u8) -> CacheKey {
        let mut bytes = [fill; CACHE_KEY_SIZE];
        bytes[..4].copy_from_slice(&prefix);
        CacheKey::from_bytes(bytes)
    }

    #[test]
    fn test_open_sizes_file() {
        let temp = TestDir::temp();
        let path = temp.path(INDEX_FILE_NAME);

        let index = IndexStore::open(&path).expect("open must succeed");
        assert_eq!(index.get_size(), 0);
        assert_eq!(
            std::fs::metadata(&path).expect("metadata must succeed").len(),
            INDEX_FILE_SIZE as u64
        );
    }

    /// A file with the wrong size (older layout, crash) gets resized.
    #[test]
    fn test_open_resizes_mismatched_file() {
        let temp = TestDir::temp().create(INDEX_FILE_NAME, FileType::ZeroFile(100));
        let path = temp.path(INDEX_FILE_NAME);

        let index = IndexStore::open(&path).expect("open must succeed");
        assert_eq!(index.get_size(), 0);
        assert_eq!(
            std::fs::metadata(&path).expect("metadata must succeed").len(),
            INDEX_FILE_SIZE as u64
        );
    }

    /// Resizing discards the old counter and key slots, not just the
    /// bytes past the old end.
    #[test]
    fn test_open_clears_mismatched_file() {
        let temp = TestDir::temp();
        let path = temp.path(INDEX_FILE_NAME);
        let key = key_with_prefix([0, 0, 0, 0], 0x5a);

        let mut contents = vec![0u8; INDEX_FILE_SIZE - 1];
        contents[..SIZE_FIELD_LEN].copy_from_slice(&u64::MAX.to_ne_bytes());
        contents[SIZE_FIELD_LEN..SIZE_FIELD_LEN + CACHE_KEY_SIZE].copy_from_slice(key.as_bytes());
        std::fs::write(&path, &contents).expect("write must succeed");

        let index = IndexStore::open(&path).expect("open must succeed");
        assert_eq!(index.get_size(), 0);
        assert!(!index.has_key(&key));

        // The cleared index still works normally.
        index.add_size(4096);
        index.put_key(&key);
        assert_eq!(index.get_size(), 4096);
        assert!(index.has_key(&key));
    }

    #[test]
    fn test_size_counter() {
        let temp = TestDir::temp();
        let index = IndexStore::open(&temp.path(INDEX_FILE_NAME)).expect("open must succeed");

        index.add_size(4096);
        index.add_size(8192);
        assert_eq!(index.get_size(), 12288);

        index.add_size(-4096);
        assert_eq!(index.get_size(), 8192);

        index.sub_size(8192);
        assert_eq!(index.get_size(), 0);

        // Saturates.
        index.sub_size(100);
        assert_eq!(index.get_size(), 0);
    }

    /// Two mappings of the same file see each other's updates, and
    /// updates survive closing and reopening the index.
    #[test]
    fn test_shared_and_persistent() {
        let temp = TestDir::temp();
        let path = temp.path(INDEX_FILE_NAME);
        let key = key_with_prefix([1, 2, 3, 4], 42);

        {
            let first = IndexStore::open(&path).expect("open must succeed");
            let second = IndexStore::open(&path).expect("open must succeed");

            first.add_size(100);
            second.add_size(23);
            first.put_key(&key);

            assert_eq!(first.get_size(), 123);
            assert_eq!(second.get_size(), 123);
            assert!(second.has_key(&key));
        }

        let reopened = IndexStore::open(&path).expect("open must succeed");
        assert_eq!(reopened.get_size(), 123);
        assert!(reopened.has_key(&key));
    }

    /// Keys that share their low 16 bits share a slot: the last
    /// writer wins.
    #[test]
    fn test_slot_collision_evicts_from_index() {
        let temp = TestDir::temp();
        let index = IndexStore::open(&temp.path(INDEX_FILE_NAME)).expect("open must succeed");

        let a = key_with_prefix([7, 9, 0, 0], 1);
        let b = key_with_prefix([7, 9, 1, 1], 2);
        assert_eq!(slot_of(&a), slot_of(&b));

        index.put_key(&a);
        assert!(index.has_key(&a));
        assert!(!index.has_key(&b));

        index.put_key(&b);
        assert!(!index.has_key(&a));
        assert!(index.has_key(&b));
    }

    #[test]
    fn test_concurrent_size_updates() {
        let temp = TestDir::temp();
        let index = IndexStore::open(&temp.path(INDEX_FILE_NAME)).expect("open must succeed");

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        index.add_size(3);
                        index.add_size(-1);
                    }
                });
            }
        });

        assert_eq!(index.get_size(), 8 * 1000 * 2);
    }

    #[derive(Arbitrary, Debug)]
    struct SlotWrite {
        key: [u8; CACHE_KEY_SIZE],
    }

    proptest! {
        /// After any sequence of writes, a key is found iff it was
        /// the last key written to its slot.
        #[test]
        fn test_last_writer_wins(writes in proptest::collection::vec(any::<SlotWrite>(), 1..50)) {
            let temp = TestDir::temp();
            let index = IndexStore::open(&temp.path(INDEX_FILE_NAME)).expect("open must succeed");

            let mut last = std::collections::HashMap::new();
            for write in &writes {
                let key = CacheKey::from_bytes(write.key);
                index.put_key(&key);
                last.insert(slot_of(&key), key);
            }

            for write in &writes {
                let key = CacheKey::from_bytes(write.key);
                prop_assert_eq!(index.has_key(&key), last[&slot_of(&key)] == key);
            }
        }
    }
}
