//! The page allocator seam.
//!
//! The cache asks the allocator for batches of page ids at eviction time
//! and prefers contiguous runs so each run becomes one batched write.
//! The allocator is supplied by the embedder (a key-value directory
//! typically owns the free-space map); [`BumpAllocator`] is the
//! self-contained implementation used standalone and in tests.

use crate::error::{Error, Result};
use crate::page_id::{PageId, RESERVED_IDS};

/// A run of `len` contiguous page ids starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRun {
    /// First id of the run.
    pub base: PageId,
    /// Number of ids in the run.
    pub len: u64,
}

/// Supplies free page ids to the cache.
///
/// `allocate(count)` returns runs totalling exactly `count` ids, none of
/// them reserved and none currently discarded. Fewer, longer runs are
/// better: each run is written with a single vectored disk call.
pub trait Allocator {
    /// Produce `count` free page ids as contiguous runs.
    fn allocate(&mut self, count: u64) -> Result<Vec<IdRun>>;
}

/// Monotonic allocator over `[2, size_sectors)`, optionally seeded with
/// recycled runs which are consumed before the bump pointer moves.
pub struct BumpAllocator {
    next: u64,
    limit: u64,
    recycled: Vec<IdRun>,
}

impl BumpAllocator {
    /// An allocator over the whole device past the reserved ids.
    pub fn new(size_sectors: u64) -> Self {
        Self::starting_at(RESERVED_IDS, size_sectors)
    }

    /// An allocator resuming from a persisted bump position, as recorded
    /// by the embedder at its last commit.
    pub fn starting_at(next: u64, size_sectors: u64) -> Self {
        assert!(next >= RESERVED_IDS && next <= size_sectors);
        BumpAllocator {
            next,
            limit: size_sectors,
            recycled: Vec::new(),
        }
    }

    /// Feed previously discarded runs back into the allocator. Call this
    /// only once the generation that referenced them is superseded.
    pub fn recycle(&mut self, runs: impl IntoIterator<Item = IdRun>) {
        for run in runs {
            assert!(
                !run.base.is_reserved() && run.base.get() + run.len <= self.limit,
                "recycled run {:?} out of the allocatable range",
                run,
            );
            if run.len > 0 {
                self.recycled.push(run);
            }
        }
    }

    fn available(&self) -> u64 {
        let recycled: u64 = self.recycled.iter().map(|r| r.len).sum();
        recycled + (self.limit - self.next)
    }
}

impl Allocator for BumpAllocator {
    fn allocate(&mut self, count: u64) -> Result<Vec<IdRun>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.available() < count {
            return Err(Error::DiskIsFull);
        }

        let mut runs = Vec::new();
        let mut needed = count;
        while needed > 0 {
            match self.recycled.pop() {
                Some(run) => {
                    let take = run.len.min(needed);
                    runs.push(IdRun {
                        base: run.base,
                        len: take,
                    });
                    if take < run.len {
                        self.recycled.push(IdRun {
                            base: run.base.add(take),
                            len: run.len - take,
                        });
                    }
                    needed -= take;
                }
                None => {
                    runs.push(IdRun {
                        base: PageId(self.next),
                        len: needed,
                    });
                    self.next += needed;
                    needed = 0;
                }
            }
        }
        Ok(runs)
    }
}
