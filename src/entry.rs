//! On-disk layout of a cache entry file:
//!
//! ```text
//! [driver identity][metadata tag: u32][metadata][trailer][compressed payload]
//! ```
//!
//! With tag 0, there is no metadata.  With tag 1, the metadata is a
//! `u32` key count followed by that many 20-byte keys.  All integers
//! are little-endian.
use std::convert::TryFrom;
use std::io::Read;
use std::io::Write;

use crate::codec::EntryTrailer;
use crate::codec::TRAILER_SIZE;
use crate::CacheKey;
use crate::DriverIdentity;
use crate::Error;
use crate::Result;
use crate::CACHE_KEY_SIZE;

const METADATA_NONE: u32 = 0;
const METADATA_KEYS: u32 = 1;

/// Opaque metadata stored alongside an entry: a list of related keys,
/// e.g., to distribute precompiled artifacts along with the keys of
/// the inputs they were linked from.  The cache never interprets it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub related_keys: Vec<CacheKey>,
}

/// A decoded cache hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub data: Vec<u8>,
    pub metadata: Option<EntryMetadata>,
}

/// The parsed fixed-size and metadata fields that precede an entry's
/// compressed payload.
#[derive(Debug)]
pub(crate) struct EntryHeader {
    pub metadata: Option<EntryMetadata>,
    pub trailer: EntryTrailer,
    /// Total header length, i.e., the payload's offset in the file.
    pub len: u64,
}

/// Serialises everything up to (excluding) the compressed payload.
pub(crate) fn write_header(
    out: &mut impl Write,
    identity: &DriverIdentity,
    metadata: Option<&EntryMetadata>,
    trailer: &EntryTrailer,
) -> std::io::Result<()> {
    out.write_all(identity.as_bytes())?;

    match metadata {
        None => out.write_all(&METADATA_NONE.to_le_bytes())?,
        Some(metadata) => {
            let count = u32::try_from(metadata.related_keys.len()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many related keys")
            })?;

            out.write_all(&METADATA_KEYS.to_le_bytes())?;
            out.write_all(&count.to_le_bytes())?;
            for key in &metadata.related_keys {
                out.write_all(key.as_bytes())?;
            }
        }
    }

    out.write_all(&trailer.to_bytes())
}

fn read_u32(input: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];

    input
        .read_exact(&mut buf)
        .map_err(|e| Error::from_entry_read(e, what))?;
    Ok(u32::from_le_bytes(buf))
}

/// Parses an entry header from `input`, for an entry file of
/// `file_len` bytes.
///
/// Fails with `IdentityMismatch` if the entry was written for another
/// driver identity, and with `Corrupt` on any malformed or truncated
/// field.
pub(crate) fn read_header(
    input: &mut impl Read,
    identity: &DriverIdentity,
    file_len: u64,
) -> Result<EntryHeader> {
    let mut stored_identity = vec![0u8; identity.len()];
    input
        .read_exact(&mut stored_identity)
        .map_err(|e| Error::from_entry_read(e, "driver identity"))?;
    if stored_identity != identity.as_bytes() {
        return Err(Error::IdentityMismatch);
    }

    let mut len = identity.len() as u64 + 4;
    let metadata = match read_u32(input, "metadata tag")? {
        METADATA_NONE => None,
        METADATA_KEYS => {
            let count = read_u32(input, "metadata key count")? as u64;
            len += 4;

            // Validate against the file size before allocating.
            let keys_len = count * CACHE_KEY_SIZE as u64;
            if len + keys_len + TRAILER_SIZE as u64 > file_len {
                return Err(Error::corrupt("metadata overruns entry"));
            }

            let mut related_keys = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let mut key = [0u8; CACHE_KEY_SIZE];
                input
                    .read_exact(&mut key)
                    .map_err(|e| Error::from_entry_read(e, "metadata keys"))?;
                related_keys.push(CacheKey::from_bytes(key));
            }

            len += keys_len;
            Some(EntryMetadata { related_keys })
        }
        tag => return Err(Error::corrupt(format!("unknown metadata tag {}", tag))),
    };

    let mut trailer = [0u8; TRAILER_SIZE];
    input
        .read_exact(&mut trailer)
        .map_err(|e| Error::from_entry_read(e, "trailer"))?;
    len += TRAILER_SIZE as u64;

    if len > file_len {
        return Err(Error::corrupt("header overruns entry"));
    }

    Ok(EntryHeader {
        metadata,
        trailer: EntryTrailer::from_bytes(&trailer),
        len,
    })
}
