//! Page identifiers and the on-page pointer codec.

use std::fmt;

/// Ids 0 and 1 hold the two superblock slots and are never handed out by
/// an allocator.
pub const RESERVED_IDS: u64 = 2;

/// The number of a page on the device, in `[0, size_sectors)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// The nil pointer. Id 0 is reserved, so 0 doubles as "no page".
    pub const NIL: PageId = PageId(0);

    /// Whether this is the nil pointer.
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }

    /// Whether this id is one of the reserved superblock slots.
    pub fn is_reserved(&self) -> bool {
        self.0 < RESERVED_IDS
    }

    /// The id `k` pages after this one.
    pub fn add(&self, k: u64) -> PageId {
        PageId(self.0 + k)
    }

    /// Raw sector offset.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for PageId {
    fn from(x: u64) -> Self {
        PageId(x)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encodes page ids into the pointer fields of interior node pages.
///
/// The width is the narrowest of 2, 4 or 8 bytes that can address every
/// sector of the device, so pointer-heavy pages compress on small
/// volumes. The width is fixed at format time.
#[derive(Debug, Clone, Copy)]
pub struct IdCodec {
    width: usize,
}

impl IdCodec {
    /// Pick the pointer width for a device with `size_sectors` pages.
    pub fn new(size_sectors: u64) -> Self {
        let width = if size_sectors <= u64::from(u16::MAX) {
            2
        } else if size_sectors <= u64::from(u32::MAX) {
            4
        } else {
            8
        };
        IdCodec { width }
    }

    /// Pointer field width in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Write `id` into the first `width()` bytes of `out`, little-endian.
    pub fn encode(&self, id: PageId, out: &mut [u8]) {
        let bytes = id.0.to_le_bytes();
        debug_assert!(
            bytes[self.width..].iter().all(|&b| b == 0),
            "page id {} exceeds pointer width {}",
            id,
            self.width,
        );
        out[..self.width].copy_from_slice(&bytes[..self.width]);
    }

    /// Read a page id from the first `width()` bytes of `data`.
    pub fn decode(&self, data: &[u8]) -> PageId {
        let mut bytes = [0u8; 8];
        bytes[..self.width].copy_from_slice(&data[..self.width]);
        PageId(u64::from_le_bytes(bytes))
    }
}
