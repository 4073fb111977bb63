//! Reads and validates entry files.
use std::fs::File;
use std::io::BufReader;
use std::io::Read;

use crate::codec;
use crate::codec::DefaultCodec;
use crate::entry;
use crate::error::is_absent_file_error;
use crate::layout;
use crate::store::DiskStore;
use crate::CacheKey;
use crate::Entry;
use crate::Error;
use crate::Result;

/// Returns the decoded entry for `key`, or `None` on miss.
///
/// Malformed entries yield `Err(Corrupt)`, and entries written for
/// another driver identity `Err(IdentityMismatch)`.
pub(crate) fn read_entry(store: &DiskStore, key: &CacheKey) -> Result<Option<Entry>> {
    let path = layout::path_for(store.root(), key);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if is_absent_file_error(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file_len = file.metadata()?.len();
    let mut input = BufReader::new(file);
    let header = entry::read_header(&mut input, store.identity(), file_len)?;

    // `read_header` guarantees the header fits in the file.
    let payload_len = file_len - header.len;
    let mut compressed = Vec::new();
    input.take(payload_len).read_to_end(&mut compressed)?;

    if compressed.len() as u64 != payload_len {
        return Err(Error::corrupt("truncated payload"));
    }

    let data = codec::decode::<DefaultCodec>(&compressed, &header.trailer)?;
    Ok(Some(Entry {
        data,
        metadata: header.metadata,
    }))
}
