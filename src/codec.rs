//! Entry payloads are stored compressed, along with a trailer that
//! records the CRC-32 and length of the *uncompressed* bytes.  The
//! length sizes (and bounds) decompression; the checksum catches
//! corruption that decompression alone does not notice.
//!
//! The compressor is fixed per build: deflate by default, or zstd
//! with the `zstd` cargo feature.  See [`DefaultCodec`].
use std::convert::TryFrom;
use std::io::Read;
use std::io::Write;

use flate2::Crc;

use crate::Error;
use crate::Result;

/// Byte length of a serialised [`EntryTrailer`].
pub const TRAILER_SIZE: usize = 4 + 8;

/// Integrity metadata for one entry payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryTrailer {
    /// CRC-32 of the uncompressed payload.
    pub checksum: u32,
    pub uncompressed_size: u64,
}

impl EntryTrailer {
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE] {
        let mut ret = [0u8; TRAILER_SIZE];

        ret[..4].copy_from_slice(&self.checksum.to_le_bytes());
        ret[4..].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        ret
    }

    pub fn from_bytes(bytes: &[u8; TRAILER_SIZE]) -> EntryTrailer {
        let mut checksum = [0u8; 4];
        let mut size = [0u8; 8];

        checksum.copy_from_slice(&bytes[..4]);
        size.copy_from_slice(&bytes[4..]);
        EntryTrailer {
            checksum: u32::from_le_bytes(checksum),
            uncompressed_size: u64::from_le_bytes(size),
        }
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();

    crc.update(data);
    crc.sum()
}

/// A compression scheme for entry payloads.
pub trait Codec {
    fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>>;

    /// Decompresses `compressed` into `out`.  Must fail unless the
    /// stream decodes to exactly `out.len()` bytes.
    fn decompress_exact(compressed: &[u8], out: &mut [u8]) -> Result<()>;
}

/// zlib-framed deflate, at the best compression level: entries are
/// written once, in the background, and read many times.
#[derive(Clone, Copy, Debug, Default)]
pub struct Deflate;

impl Codec for Deflate {
    fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn decompress_exact(compressed: &[u8], out: &mut [u8]) -> Result<()> {
        use flate2::read::ZlibDecoder;

        let mut decoder = ZlibDecoder::new(compressed);
        decoder
            .read_exact(out)
            .map_err(|e| Error::corrupt(format!("deflate stream: {}", e)))?;

        // The stream must end exactly where the trailer said.
        let mut extra = [0u8; 1];
        match decoder.read(&mut extra) {
            Ok(0) => Ok(()),
            Ok(_) => Err(Error::corrupt("deflate stream longer than recorded size")),
            Err(e) => Err(Error::corrupt(format!("deflate stream: {}", e))),
        }
    }
}

/// zstd at level 1: much faster than deflate, for a slightly lower
/// compression ratio.
#[cfg(feature = "zstd")]
#[derive(Clone, Copy, Debug, Default)]
pub struct Zstd;

#[cfg(feature = "zstd")]
impl Codec for Zstd {
    fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
        zstd::bulk::compress(raw, 1)
    }

    fn decompress_exact(compressed: &[u8], out: &mut [u8]) -> Result<()> {
        // Fails if the frame decodes to more than `out.len()` bytes.
        let written = zstd::bulk::decompress_to_buffer(compressed, out)
            .map_err(|e| Error::corrupt(format!("zstd frame: {}", e)))?;

        if written != out.len() {
            return Err(Error::corrupt("zstd frame shorter than recorded size"));
        }

        Ok(())
    }
}

#[cfg(feature = "zstd")]
pub type DefaultCodec = Zstd;

#[cfg(not(feature = "zstd"))]
pub type DefaultCodec = Deflate;

/// Checksums and compresses `raw`.
pub fn encode<C: Codec>(raw: &[u8]) -> std::io::Result<(Vec<u8>, EntryTrailer)> {
    let trailer = EntryTrailer {
        checksum: crc32(raw),
        uncompressed_size: raw.len() as u64,
    };

    Ok((C::compress(raw)?, trailer))
}

/// Decompresses `compressed` to exactly `trailer.uncompressed_size`
/// bytes, and validates the result against `trailer.checksum`.
pub fn decode<C: Codec>(compressed: &[u8], trailer: &EntryTrailer) -> Result<Vec<u8>> {
    let size = usize::try_from(trailer.uncompressed_size)
        .map_err(|_| Error::corrupt("uncompressed size overflows usize"))?;

    // A corrupt trailer could claim anything; don't let it abort the
    // process on allocation failure.
    let mut out = Vec::new();
    out.try_reserve_exact(size)
        .map_err(|_| Error::corrupt("uncompressed size too large"))?;
    out.resize(size, 0);

    C::decompress_exact(compressed, &mut out)?;

    if crc32(&out) != trailer.checksum {
        return Err(Error::corrupt("checksum mismatch"));
    }

    Ok(out)
}
