use crate::page_id::PageId;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store core.
///
/// I/O errors are wrapped exactly once, at the disk adapter boundary.
/// Invariant violations (touching a freed sector, re-entering eviction,
/// requiring a resident page that is on disk) are bugs in the caller and
/// panic instead of appearing here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying device failed a read.
    #[error("disk read failed: {0}")]
    Read(#[source] std::io::Error),
    /// The underlying device failed a write.
    #[error("disk write failed: {0}")]
    Write(#[source] std::io::Error),
    /// A page read back from disk did not match its recorded digest.
    #[error("invalid checksum for page {0}")]
    InvalidChecksum(PageId),
    /// Superblock slots carry the right magic but none verifies.
    #[error("all on-disk generations are corrupted")]
    AllGenerationsCorrupted,
    /// No superblock magic was found on the device.
    #[error("disk is not formatted")]
    DiskNotFormatted,
    /// The allocator cannot supply the requested number of page ids.
    #[error("disk is full")]
    DiskIsFull,
    /// The on-disk page size does not match the device sector size.
    #[error("wrong page size recorded on disk: {0}")]
    WrongPageSize(u32),
    /// The on-disk sector count does not match the device.
    #[error("wrong disk size recorded on disk: {0} sectors")]
    WrongDiskSize(u64),
    /// The device was formatted with a different checksum algorithm.
    #[error("wrong checksum algorithm: {name} with digest size {size}")]
    WrongChecksumAlgorithm {
        /// Algorithm name recorded in the superblock.
        name: String,
        /// Digest size recorded in the superblock.
        size: usize,
    },
}
