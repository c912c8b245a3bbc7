//! Pluggable page checksums.
//!
//! The algorithm is chosen at format time and recorded in the superblock;
//! every page written by the store carries its digest in the trailing
//! `digest_size()` bytes of the page.

/// A checksum algorithm applied to whole pages.
pub trait Checksum {
    /// Stable algorithm name, recorded in the superblock.
    fn name(&self) -> &str;
    /// Size of the digest in bytes. May be zero.
    fn digest_size(&self) -> usize;
    /// Compute the digest of `data`. The returned vector is exactly
    /// `digest_size()` bytes long.
    fn compute(&self, data: &[u8]) -> Vec<u8>;
}

/// CRC32 (IEEE) page checksums.
pub struct Crc32;

impl Checksum for Crc32 {
    fn name(&self) -> &str {
        "crc32"
    }

    fn digest_size(&self) -> usize {
        4
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize().to_le_bytes().to_vec()
    }
}

/// The no-op checksum: zero-byte digests, verification always passes.
pub struct NoChecksum;

impl Checksum for NoChecksum {
    fn name(&self) -> &str {
        "none"
    }

    fn digest_size(&self) -> usize {
        0
    }

    fn compute(&self, _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}
