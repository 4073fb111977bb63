//! Error type for cache operations, and the classification of the
//! filesystem errors we expect during regular operations: processes
//! sharing a cache directory race on files without any locking.
use std::io::ErrorKind;

use thiserror::Error;

/// Errors surfaced by the fallible (`try_*`) cache operations.  The
/// convenience entry points on [`crate::Cache`] never return these:
/// they log and degrade to a miss or a no-op instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The entry is truncated, malformed, or fails its checksum.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    /// The entry was written under a different driver identity.  With
    /// identity-salted keys, this means a hash collision.
    #[error("cache entry driver identity mismatch")]
    IdentityMismatch,

    #[error("cache keys are 20 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("cache directory unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(what: impl Into<String>) -> Error {
        Error::Corrupt(what.into())
    }

    /// Converts errors from reading an entry's fixed-size fields: an
    /// early EOF means the file is truncated, not that the disk failed.
    pub(crate) fn from_entry_read(error: std::io::Error, what: &str) -> Error {
        if error.kind() == ErrorKind::UnexpectedEof {
            Error::Corrupt(format!("truncated {}", what))
        } else {
            Error::Io(error)
        }
    }

    /// Returns whether this error should be reported as a corrupt or
    /// unusable entry (as opposed to a filesystem failure).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt(_) | Error::IdentityMismatch)
    }
}

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to read
/// isn't available on the server anymore; evictors in other processes
/// delete entries all the time, so both are plain cache misses.
pub(crate) fn is_absent_file_error(error: &std::io::Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

#[test]
fn test_absent_file_errors() {
    use std::io::Error as IoError;

    assert!(is_absent_file_error(&IoError::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&IoError::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&IoError::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&IoError::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&IoError::from_raw_os_error(libc::EIO)));
}

#[test]
fn test_entry_read_classification() {
    use std::io::Error as IoError;

    let eof = Error::from_entry_read(IoError::new(ErrorKind::UnexpectedEof, "eof"), "trailer");
    assert!(matches!(&eof, Error::Corrupt(msg) if msg == "truncated trailer"));
    assert!(eof.is_corruption());

    let io = Error::from_entry_read(IoError::from_raw_os_error(libc::EIO), "trailer");
    assert!(matches!(io, Error::Io(_)));
    assert!(!io.is_corruption());

    assert!(Error::IdentityMismatch.is_corruption());
}
