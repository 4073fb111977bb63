//! Entries are published atomically: we write the whole file under a
//! temporary name in the destination shard, and `rename(2)` it over
//! the final path.  Readers thus see either the old entry, the new
//! one, or nothing, never a partial write.
use std::io::BufWriter;
use std::io::Write;

use crate::codec;
use crate::codec::DefaultCodec;
use crate::entry;
use crate::evict::disk_usage;
use crate::evict::TEMP_SUFFIX;
use crate::layout;
use crate::store::DiskStore;
use crate::CacheKey;
use crate::EntryMetadata;
use crate::Result;

/// Upper bound on evictions before each write.  The size limit is
/// soft: if we can't free enough space, we write anyway.
pub(crate) const MAX_EVICTION_ATTEMPTS: usize = 8;

fn set_read_only(file: &std::fs::File) -> std::io::Result<()> {
    let mut permissions = file.metadata()?.permissions();

    permissions.set_readonly(true);
    file.set_permissions(permissions)
}

/// Makes room for `data`, then durably stores it (and `metadata`)
/// under `key`, replacing any previous entry.
pub(crate) fn write_entry(
    store: &DiskStore,
    key: &CacheKey,
    data: &[u8],
    metadata: Option<&EntryMetadata>,
) -> Result<()> {
    let shard = layout::shard_dir(store.root(), key);
    layout::ensure_dir(&shard)?;

    for _ in 0..MAX_EVICTION_ATTEMPTS {
        if !store.over_budget(data.len() as u64) {
            break;
        }

        store.evict_one();
    }

    let (compressed, trailer) = codec::encode::<DefaultCodec>(data)?;

    let name = layout::entry_name(key);
    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}.", name))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(&shard)?;

    {
        let mut out = BufWriter::new(temp.as_file_mut());

        entry::write_header(&mut out, store.identity(), metadata, &trailer)?;
        out.write_all(&compressed)?;
        out.flush()?;
    }

    set_read_only(temp.as_file())?;

    let path = shard.join(&name);
    let replaced = std::fs::symlink_metadata(&path)
        .map(|meta| disk_usage(&meta))
        .unwrap_or(0);

    // On failure, dropping the `PersistError` deletes the temporary file.
    temp.persist(&path).map_err(|e| e.error)?;

    // Stat by path once the file is closed, so that we charge the
    // same usage the evictor will credit back when it deletes it.
    let written = match std::fs::symlink_metadata(&path) {
        Ok(meta) => disk_usage(&meta),
        // Already evicted by someone else.
        Err(_) => 0,
    };

    store.index().add_size(written as i64);
    store.index().sub_size(replaced);
    store.index().put_key(key);

    tracing::debug!(%key, written, replaced, "stored cache entry");
    Ok(())
}
