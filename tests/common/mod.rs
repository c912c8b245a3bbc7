#![allow(dead_code)]

use ropestore::{Allocator, BumpAllocator, Checksum, Context, MemDisk, NoChecksum, Options};
use std::rc::Rc;

pub const SECTOR_SIZE: u32 = 512;
pub const SECTORS: u64 = 4096;

pub struct TestStore {
    pub disk: Rc<MemDisk>,
    pub ctx: Rc<Context>,
}

/// A store with the boundary-scenario geometry: 512-byte pages, a
/// 4-page cache evicting down to 2, and no page checksums.
pub fn small_store() -> TestStore {
    store_with(Rc::new(NoChecksum), 4, 2, 2)
}

pub fn store_with(
    checksum: Rc<dyn Checksum>,
    max_lru: usize,
    min_lru: usize,
    alloc_start: u64,
) -> TestStore {
    let disk = Rc::new(MemDisk::new(SECTOR_SIZE, SECTORS));
    reopen(disk, checksum, max_lru, min_lru, alloc_start)
}

/// A fresh cache over an existing disk, as after a restart. The
/// allocator resumes from `alloc_start`, standing in for the bump
/// position a real embedder would persist.
pub fn reopen(
    disk: Rc<MemDisk>,
    checksum: Rc<dyn Checksum>,
    max_lru: usize,
    min_lru: usize,
    alloc_start: u64,
) -> TestStore {
    let allocator: Box<dyn Allocator> = Box::new(BumpAllocator::starting_at(alloc_start, SECTORS));
    let mut opts = Options::new();
    opts.max_lru_size(max_lru).min_lru_size(min_lru);
    let ctx = Context::new(Box::new(disk.clone()), checksum, allocator, opts);
    TestStore { disk, ctx }
}
