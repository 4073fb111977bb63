//! The driver identity namespaces cache entries per producer
//! configuration: it salts every key computation, and prefixes every
//! stored entry so readers can detect cross-configuration collisions.
use std::sync::Arc;

use crate::CacheKey;

/// Bump whenever the layout of entries or of the index changes.
pub const CACHE_FORMAT_VERSION: u8 = 1;

/// An immutable, cheaply cloneable fingerprint of the producer
/// configuration: format version, NUL-terminated producer id,
/// NUL-terminated target id, pointer width, and little-endian
/// feature flags, in that order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverIdentity {
    blob: Arc<[u8]>,
}

impl DriverIdentity {
    pub fn new(producer_id: &str, target_id: &str, feature_flags: u64) -> DriverIdentity {
        let mut blob = Vec::with_capacity(producer_id.len() + target_id.len() + 1 + 2 + 1 + 8);

        blob.push(CACHE_FORMAT_VERSION);
        blob.extend_from_slice(producer_id.as_bytes());
        blob.push(0);
        blob.extend_from_slice(target_id.as_bytes());
        blob.push(0);
        // Producers sometimes cache structs with pointer-sized fields.
        blob.push(std::mem::size_of::<usize>() as u8);
        blob.extend_from_slice(&feature_flags.to_le_bytes());

        DriverIdentity { blob: blob.into() }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blob.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    /// Returns the SHA-1 of `identity || data`.
    pub fn compute_key(&self, data: &[u8]) -> CacheKey {
        use extendhash::sha1;

        let mut input = Vec::with_capacity(self.blob.len() + data.len());
        input.extend_from_slice(&self.blob);
        input.extend_from_slice(data);

        CacheKey::from_bytes(sha1::compute_hash(&input))
    }
}

#[test]
fn test_blob_layout() {
    let identity = DriverIdentity::new("prod", "gpu", 0x0102030405060708);
    let ptr = std::mem::size_of::<usize>() as u8;

    let mut expected = vec![CACHE_FORMAT_VERSION];
    expected.extend_from_slice(b"prod\0gpu\0");
    expected.push(ptr);
    expected.extend_from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]);

    assert_eq!(identity.as_bytes(), &expected[..]);
    assert_eq!(identity.len(), expected.len());
}

/// The NUL terminators keep ("ab", "c") and ("a", "bc") apart.
#[test]
fn test_blob_separates_fields() {
    let a = DriverIdentity::new("ab", "c", 0);
    let b = DriverIdentity::new("a", "bc", 0);

    assert_ne!(a, b);
    assert_ne!(a.compute_key(b"x"), b.compute_key(b"x"));
}

#[test]
fn test_compute_key() {
    let identity = DriverIdentity::new("test", "gpuX", 0);

    // Deterministic...
    assert_eq!(identity.compute_key(b"shader"), identity.compute_key(b"shader"));
    // ... depends on the input ...
    assert_ne!(identity.compute_key(b"shader"), identity.compute_key(b"shader2"));
    // ... and on the identity.
    let flagged = DriverIdentity::new("test", "gpuX", 1);
    assert_ne!(identity.compute_key(b"shader"), flagged.compute_key(b"shader"));

    // And it's a plain SHA-1 of the concatenation.
    let mut input = identity.as_bytes().to_vec();
    input.extend_from_slice(b"shader");
    assert_eq!(
        identity.compute_key(b"shader").as_bytes(),
        &extendhash::sha1::compute_hash(&input)
    );
}
