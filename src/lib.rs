#![warn(missing_docs)]

//! The core of a persistent key-value store that lives directly on a
//! block device.
//!
//! Two tightly-coupled subsystems make up the crate:
//!
//! - the **page cache** ([`Context`]): a bounded pool of fixed-size
//!   device pages with lazy write-back. Eviction is cooperative: each
//!   page carries a finalizer that commits it, dirty children commit
//!   before their parents, and batches of pages are laid out on
//!   contiguous id runs so each run flushes with one vectored write;
//! - the **rope** ([`Rope`]): a persistent variable-length byte
//!   container built as a tree of cached pages, supporting append,
//!   random reads, and in-place overwrite across page boundaries.
//!
//! The block device, the checksum algorithm, and the page allocator are
//! seams ([`Disk`], [`Checksum`], [`Allocator`]): the embedding store
//! supplies them once per opened device. [`superblock`] carries the thin
//! format/open/generation-swap rim on top.
//!
//! ```no_run
//! use ropestore::{superblock, BumpAllocator, Context, Crc32, Disk, MemDisk, Options, Rope};
//! use std::rc::Rc;
//!
//! # fn main() -> ropestore::Result<()> {
//! let disk = Rc::new(MemDisk::new(512, 4096));
//! let mut sb = superblock::format(&*disk, &Crc32)?;
//!
//! let ctx = Context::new(
//!     Box::new(disk.clone()),
//!     Rc::new(Crc32),
//!     Box::new(BumpAllocator::new(disk.info().size_sectors)),
//!     Options::new(),
//! );
//!
//! let mut rope = Rope::create(&ctx);
//! rope.append(b"hello, rope")?;
//! let root = rope.commit()?;
//! superblock::commit_generation(&ctx, &mut sb, root)?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate is single-threaded by design: work suspends only inside
//! the disk adapter, and the only mutual exclusion is the eviction
//! interlock, whose violation is a bug rather than contention.

mod alloc;
mod cache;
mod checksum;
mod discarded;
mod disk;
mod error;
mod lru;
mod options;
mod page_id;
mod pool;
mod rope;

pub mod superblock;

pub use alloc::{Allocator, BumpAllocator, IdRun};
pub use cache::{CacheStats, Context, Finalize, FinalizeFn, PendingBatch, SectorHandle, WriteFn};
pub use checksum::{Checksum, Crc32, NoChecksum};
pub use discarded::DiscardedSet;
pub use disk::{Disk, DiskInfo, FileDisk, MemDisk};
pub use error::{Error, Result};
pub use options::Options;
pub use page_id::{IdCodec, PageId, RESERVED_IDS};
pub use pool::PageBuf;
pub use rope::Rope;
pub use superblock::Superblock;
