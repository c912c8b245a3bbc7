//! The page cache.
//!
//! A bounded set of in-memory pages over the disk adapter. Every logical
//! page is tracked by a sector record in one of three states:
//!
//! ```rust,ignore
//! InMemory(buf)   // resident; owns exactly one pool buffer
//! OnDisk(id)      // contents known only by reference
//! Freed           // logically deleted; any access is a bug
//! ```
//!
//! Sectors carry a finalizer that commits them on eviction. Finalizers
//! either write the page themselves ([`Finalize::Evicted`]) or defer to
//! the batch commit ([`Finalize::Pending`]), which allocates contiguous
//! id runs, invokes the deferred writers leaves-first (a parent's page
//! embeds its children's ids, so children must be assigned ids before
//! the parent serializes), and flushes each run with one vectored write.

use crate::alloc::{Allocator, IdRun};
use crate::checksum::Checksum;
use crate::discarded::DiscardedSet;
use crate::disk::{Disk, DiskInfo};
use crate::error::Result;
use crate::lru::Lru;
use crate::options::Options;
use crate::page_id::{IdCodec, PageId};
use crate::pool::{PageBuf, Pool};
use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;

/// What a finalizer produced for an evicted page.
pub enum Finalize {
    /// The finalizer committed the page itself and this is its id.
    Evicted(PageId),
    /// Commit is deferred to the batch phase.
    Pending {
        /// Height of the page in its tree; leaves are 0. Lower heights
        /// commit first.
        height: u16,
        /// Serializes the page for the assigned id, marks the sector
        /// `OnDisk`, and surrenders the buffer for the batched write.
        write: WriteFn,
    },
}

/// Deferred page writer; see [`Finalize::Pending`].
pub type WriteFn = Box<dyn FnOnce(&Context, PageId) -> Result<PageBuf>>;

/// A sector finalizer. Called when the page is evicted; interior nodes
/// use the batch to finalize still-resident children first.
pub type FinalizeFn = Rc<dyn Fn(&Context, &mut PendingBatch) -> Result<Finalize>>;

/// Pages whose finalizers deferred their commit to the current batch.
pub type PendingBatch = Vec<PendingEntry>;

/// One deferred commit within a [`PendingBatch`].
pub struct PendingEntry {
    handle: SectorHandle,
    height: u16,
    write: WriteFn,
}

enum State {
    InMemory(PageBuf),
    OnDisk(PageId),
    Freed,
}

struct Sector {
    state: State,
    finalize: Option<FinalizeFn>,
    /// LRU slot while attached.
    slot: Option<usize>,
    /// Detach-removed: may never be attached again.
    poisoned: bool,
    /// Pinned by the client (roots); never attached.
    pinned: bool,
    /// Finalized into a batch whose commit is still outstanding.
    pending: bool,
}

/// A handle to a sector record. Cheap to clone; handles held by clients
/// keep the record alive after it leaves the LRU.
#[derive(Clone)]
pub struct SectorHandle {
    inner: Rc<RefCell<Sector>>,
}

impl SectorHandle {
    fn new(state: State) -> Self {
        SectorHandle {
            inner: Rc::new(RefCell::new(Sector {
                state,
                finalize: None,
                slot: None,
                poisoned: false,
                pinned: false,
                pending: false,
            })),
        }
    }

    /// Whether the sector currently holds a buffer.
    pub fn is_in_memory(&self) -> bool {
        matches!(self.inner.borrow().state, State::InMemory(_))
    }

    /// The sector's on-disk id, if it has one.
    pub fn on_disk_id(&self) -> Option<PageId> {
        match self.inner.borrow().state {
            State::OnDisk(id) => Some(id),
            _ => None,
        }
    }

    /// The id of a sector that was committed and removed from the LRU.
    /// Such a handle is spent: re-reading the page requires a fresh
    /// handle created from the returned id.
    pub(crate) fn retired_id(&self) -> Option<PageId> {
        let s = self.inner.borrow();
        match s.state {
            State::OnDisk(id) if s.poisoned => Some(id),
            _ => None,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Attached (evictable) sectors.
    pub lru_len: usize,
    /// Sectors holding a buffer, attached or not.
    pub in_memory: usize,
    /// Free buffers pooled for reuse.
    pub pool_available: usize,
    /// Ids waiting in the discarded set.
    pub discarded: u64,
}

/// The page cache and its collaborators: disk, checksum, allocator,
/// buffer pool, LRU, and the discarded-id set.
///
/// Single-threaded by design; work may suspend only inside the disk
/// adapter. Eviction is guarded by an interlock: re-entering the
/// eviction path is a bug and panics.
pub struct Context {
    disk: Box<dyn Disk>,
    checksum: Rc<dyn Checksum>,
    allocator: RefCell<Box<dyn Allocator>>,
    info: DiskInfo,
    codec: IdCodec,
    opts: Options,
    lru: RefCell<Lru<SectorHandle>>,
    pool: RefCell<Pool>,
    discarded: RefCell<DiscardedSet>,
    in_memory: Cell<usize>,
    evict_ok: Cell<bool>,
}

struct EvictGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> EvictGuard<'a> {
    fn claim(flag: &'a Cell<bool>) -> Self {
        assert!(flag.get(), "page cache eviction re-entered");
        flag.set(false);
        EvictGuard { flag }
    }
}

impl Drop for EvictGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(true);
    }
}

impl Context {
    /// Build a cache over `disk`. The checksum must match the one the
    /// device was formatted with; the allocator supplies page ids at
    /// commit time.
    pub fn new(
        disk: Box<dyn Disk>,
        checksum: Rc<dyn Checksum>,
        allocator: Box<dyn Allocator>,
        opts: Options,
    ) -> Rc<Context> {
        let info = disk.info();
        let page_size = info.sector_size as usize;
        assert!(
            opts.min_lru_size >= 1 && opts.min_lru_size <= opts.max_lru_size,
            "lru bounds must satisfy 1 <= min <= max"
        );
        assert!(
            (64..=65536).contains(&page_size),
            "page size {} out of supported range",
            page_size
        );
        assert!(
            checksum.digest_size() * 4 < page_size,
            "digest size {} too large for page size {}",
            checksum.digest_size(),
            page_size
        );
        Rc::new(Context {
            codec: IdCodec::new(info.size_sectors),
            pool: RefCell::new(Pool::new(page_size, opts.max_lru_size)),
            disk,
            checksum,
            allocator: RefCell::new(allocator),
            info,
            opts,
            lru: RefCell::new(Lru::new()),
            discarded: RefCell::new(DiscardedSet::new()),
            in_memory: Cell::new(0),
            evict_ok: Cell::new(true),
        })
    }

    /// Page size in bytes, equal to the device sector size.
    pub fn page_size(&self) -> usize {
        self.info.sector_size as usize
    }

    /// The device geometry.
    pub fn disk_info(&self) -> DiskInfo {
        self.info
    }

    /// The pointer codec for this device.
    pub fn id_codec(&self) -> IdCodec {
        self.codec
    }

    /// The page checksum algorithm.
    pub fn checksum(&self) -> &dyn Checksum {
        &*self.checksum
    }

    /// Current cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lru_len: self.lru.borrow().len(),
            in_memory: self.in_memory.get(),
            pool_available: self.pool.borrow().available(),
            discarded: self.discarded.borrow().len(),
        }
    }

    // ----- sector lifecycle -----

    /// Allocate a fresh detached page: resident, zeroed, unevictable
    /// until a finalizer is registered. Never evicts.
    pub fn allocate(&self) -> SectorHandle {
        let buf = self.pool.borrow_mut().take();
        self.in_memory.set(self.in_memory.get() + 1);
        SectorHandle::new(State::InMemory(buf))
    }

    /// Allocate a fresh page attached to the LRU front, evicting first
    /// if the cache is full and eviction is currently permitted.
    pub fn allocate_attached(&self) -> Result<SectorHandle> {
        if self.evict_ok.get() && self.lru.borrow().len() >= self.opts.max_lru_size {
            self.make_room()?;
        }
        let h = self.allocate();
        let slot = self.lru.borrow_mut().push_front(h.clone());
        h.inner.borrow_mut().slot = Some(slot);
        Ok(h)
    }

    /// A detached handle for a page known only by its on-disk id. The
    /// sector attaches once it is faulted in.
    pub fn from_id(&self, id: PageId) -> SectorHandle {
        assert!(!id.is_nil(), "nil page id");
        SectorHandle::new(State::OnDisk(id))
    }

    /// Register the finalizer that commits this sector on eviction, and
    /// attach the sector if it is resident.
    pub fn set_finalize(&self, h: &SectorHandle, finalize: FinalizeFn) {
        h.inner.borrow_mut().finalize = Some(finalize);
        self.attach(h);
    }

    /// Pin the sector: it will never be attached to the LRU. Used for
    /// roots, whose commit is driven explicitly.
    pub fn pin(&self, h: &SectorHandle) {
        h.inner.borrow_mut().pinned = true;
    }

    /// Undo [`Context::pin`].
    pub fn unpin(&self, h: &SectorHandle) {
        h.inner.borrow_mut().pinned = false;
    }

    /// Attach the sector at the LRU front if it is resident and
    /// attachable. No-op otherwise.
    pub fn attach(&self, h: &SectorHandle) {
        let mut s = h.inner.borrow_mut();
        if s.slot.is_some() || s.poisoned || s.pinned {
            return;
        }
        if !matches!(s.state, State::InMemory(_)) {
            return;
        }
        let slot = self.lru.borrow_mut().push_front(h.clone());
        s.slot = Some(slot);
    }

    /// Detach the sector from the LRU without poisoning it.
    pub fn detach(&self, h: &SectorHandle) {
        let mut s = h.inner.borrow_mut();
        if let Some(slot) = s.slot.take() {
            self.lru.borrow_mut().detach(slot);
        }
    }

    fn touch(&self, h: &SectorHandle) {
        let slot = h.inner.borrow().slot;
        if let Some(slot) = slot {
            self.lru.borrow_mut().touch(slot);
        }
    }

    /// Ensure the sector is resident, reading it from disk if needed.
    /// Returns the id the page was read from, or `None` if it was
    /// already resident. The old id goes to the discarded set: a faulted
    /// page is always rewritten to a fresh id when it next commits.
    pub fn fault_in(&self, h: &SectorHandle) -> Result<Option<PageId>> {
        let id = {
            let s = h.inner.borrow();
            match s.state {
                State::InMemory(_) => None,
                State::OnDisk(id) => Some(id),
                State::Freed => panic!("access to freed sector"),
            }
        };
        let Some(id) = id else {
            self.touch(h);
            return Ok(None);
        };
        if self.evict_ok.get() && self.lru.borrow().len() >= self.opts.max_lru_size {
            self.make_room()?;
        }
        let mut buf = self.pool.borrow_mut().take();
        self.disk
            .read(id.get(), std::slice::from_mut(&mut buf))?;
        h.inner.borrow_mut().state = State::InMemory(buf);
        self.in_memory.set(self.in_memory.get() + 1);
        self.discarded.borrow_mut().add(id);
        self.attach(h);
        Ok(Some(id))
    }

    /// The sector's page buffer. Touches the LRU. Panics unless the
    /// sector is resident; call [`Context::fault_in`] first when the
    /// page may be on disk.
    pub fn buf<'a>(&self, h: &'a SectorHandle) -> RefMut<'a, [u8]> {
        self.touch(h);
        RefMut::map(h.inner.borrow_mut(), |s| match &mut s.state {
            State::InMemory(buf) => &mut buf[..],
            State::OnDisk(_) => panic!("resident page required but sector is on disk"),
            State::Freed => panic!("access to freed sector"),
        })
    }

    /// Record that the sector now lives at `id`: release its buffer to
    /// the pool and remove it from the LRU for good. Asserts id equality
    /// if the sector is already on disk.
    pub fn set_id(&self, h: &SectorHandle, id: PageId) {
        let mut s = h.inner.borrow_mut();
        match std::mem::replace(&mut s.state, State::Freed) {
            State::InMemory(buf) => {
                self.pool.borrow_mut().release_one(buf);
                self.in_memory.set(self.in_memory.get() - 1);
                s.state = State::OnDisk(id);
            }
            State::OnDisk(existing) => {
                assert_eq!(existing, id, "sector already on disk at {}", existing);
                s.state = State::OnDisk(existing);
            }
            State::Freed => panic!("access to freed sector"),
        }
        s.pending = false;
        s.poisoned = true;
        if let Some(slot) = s.slot.take() {
            self.lru.borrow_mut().detach(slot);
        }
    }

    /// The batch-commit variant of [`Context::set_id`]: the buffer is
    /// surrendered to the caller for the vectored write instead of going
    /// back to the pool.
    pub(crate) fn seal(&self, h: &SectorHandle, id: PageId) -> PageBuf {
        let mut s = h.inner.borrow_mut();
        let buf = match std::mem::replace(&mut s.state, State::OnDisk(id)) {
            State::InMemory(buf) => buf,
            _ => panic!("sealed sector must be resident"),
        };
        self.in_memory.set(self.in_memory.get() - 1);
        s.pending = false;
        s.poisoned = true;
        if let Some(slot) = s.slot.take() {
            self.lru.borrow_mut().detach(slot);
        }
        buf
    }

    /// Delete the sector: its buffer (if any) returns to the pool and
    /// every later access panics.
    pub fn unallocate(&self, h: &SectorHandle) {
        let mut s = h.inner.borrow_mut();
        if let State::InMemory(buf) = std::mem::replace(&mut s.state, State::Freed) {
            self.pool.borrow_mut().release_one(buf);
            self.in_memory.set(self.in_memory.get() - 1);
        }
        s.pending = false;
        s.poisoned = true;
        s.finalize = None;
        if let Some(slot) = s.slot.take() {
            self.lru.borrow_mut().detach(slot);
        }
    }

    /// [`Context::unallocate`], but an on-disk sector also surrenders
    /// its id to the discarded set. Used by tree-freeing traversals.
    pub fn drop_release(&self, h: &SectorHandle) {
        if let Some(id) = h.on_disk_id() {
            self.discarded.borrow_mut().add(id);
        }
        self.unallocate(h);
    }

    // ----- discarded ids -----

    /// Add one id to the discarded set.
    pub fn discard(&self, id: PageId) {
        self.discarded.borrow_mut().add(id);
    }

    /// Add a run of ids to the discarded set.
    pub fn discard_range(&self, run: IdRun) {
        self.discarded.borrow_mut().add_range(run.base, run.len);
    }

    /// Take every discarded range, emptying the set.
    pub fn acquire_discarded(&self) -> Vec<IdRun> {
        self.discarded.borrow_mut().drain_as_ranges()
    }

    // ----- eviction -----

    /// Finalize one sector into `batch`. Resolves immediately for
    /// sectors that are already on disk or already pending; otherwise
    /// runs the finalizer and either applies an [`Finalize::Evicted`]
    /// result or detaches the sector and queues its deferred write.
    pub fn finalize_sector(&self, h: &SectorHandle, batch: &mut PendingBatch) -> Result<()> {
        let finalize = {
            let s = h.inner.borrow();
            if s.pending {
                return Ok(());
            }
            match s.state {
                State::OnDisk(_) => return Ok(()),
                State::Freed => panic!("access to freed sector"),
                State::InMemory(_) => {}
            }
            s.finalize
                .clone()
                .expect("evictable sector has no finalizer")
        };
        match finalize(self, batch)? {
            Finalize::Evicted(id) => self.set_id(h, id),
            Finalize::Pending { height, write } => {
                h.inner.borrow_mut().pending = true;
                self.detach(h);
                batch.push(PendingEntry {
                    handle: h.clone(),
                    height,
                    write,
                });
            }
        }
        Ok(())
    }

    /// Evict from the LRU tail until the cache has room again, then
    /// commit the deferred writes in one batch.
    pub fn make_room(&self) -> Result<()> {
        let _guard = EvictGuard::claim(&self.evict_ok);
        let mut batch = PendingBatch::new();
        loop {
            let Some(tail) = self.lru.borrow().peek_back() else {
                break;
            };
            {
                let s = tail.inner.borrow();
                if s.finalize.is_none() {
                    // unevictable tail blocks further eviction
                    break;
                }
            }
            if self.lru.borrow().len() < self.opts.min_lru_size
                && (self.pool.borrow().available() > 0 || !batch.is_empty())
            {
                break;
            }
            let tail = self.lru.borrow_mut().pop_back().expect("peeked above");
            tail.inner.borrow_mut().slot = None;
            if !tail.is_in_memory() {
                debug_assert!(false, "attached sector without a buffer");
                continue;
            }
            if let Err(e) = self.finalize_sector(&tail, &mut batch) {
                self.attach(&tail);
                self.restore_batch(batch);
                return Err(e);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        tracing::debug!(pending = batch.len(), lru = self.lru.borrow().len(), "evicting page batch");
        self.commit_batch(batch)
    }

    /// Commit a batch of deferred writes: allocate contiguous id runs,
    /// run the writers leaves-first, and flush each run with a single
    /// vectored write. Ids left unused by a failed or shrunken batch go
    /// to the discarded set; entries whose writer never ran stay
    /// resident and evictable.
    pub(crate) fn commit_batch(&self, mut batch: PendingBatch) -> Result<()> {
        // A sector may have been superseded (committed or freed some
        // other way) between finalize and commit.
        batch.retain(|e| e.handle.is_in_memory());
        let requested = batch.len() as u64;
        if requested == 0 {
            return Ok(());
        }
        let runs = match self.allocator.borrow_mut().allocate(requested) {
            Ok(runs) => runs,
            Err(e) => {
                self.restore_batch(batch);
                return Err(e);
            }
        };
        debug_assert_eq!(runs.iter().map(|r| r.len).sum::<u64>(), requested);

        // children first: parents embed the ids assigned below them
        batch.sort_by_key(|e| e.height);
        let mut entries: VecDeque<PendingEntry> = batch.into();

        let mut failure = None;
        for run in runs {
            assert!(!run.base.is_reserved(), "allocator returned a reserved id");
            if failure.is_some() {
                self.discard_range(run);
                continue;
            }
            let used = (entries.len() as u64).min(run.len);
            if used < run.len {
                self.discard_range(IdRun {
                    base: run.base.add(used),
                    len: run.len - used,
                });
            }
            let mut bufs = Vec::with_capacity(used as usize);
            for k in 0..used {
                // UNWRAP: `used` never exceeds the queue length.
                let entry = entries.pop_front().unwrap();
                let id = run.base.add(k);
                match (entry.write)(self, id) {
                    Ok(buf) => bufs.push(buf),
                    Err(e) => {
                        // this id and the rest of the run go unused
                        self.discard_range(IdRun {
                            base: id,
                            len: used - k,
                        });
                        entry.handle.inner.borrow_mut().pending = false;
                        self.attach(&entry.handle);
                        failure = Some(e);
                        break;
                    }
                }
            }
            if bufs.is_empty() {
                continue;
            }
            tracing::trace!(base = %run.base, pages = bufs.len(), "writing page run");
            if let Err(e) = self.disk.write(run.base.get(), &bufs) {
                failure = Some(e);
            }
            self.pool.borrow_mut().release(bufs);
        }

        // anything still queued was never written; keep it resident
        self.restore_batch(entries.into_iter().collect());
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Put uncommitted batch entries back into a consistent state:
    /// resident, not pending, evictable again.
    fn restore_batch(&self, batch: PendingBatch) {
        for entry in batch {
            entry.handle.inner.borrow_mut().pending = false;
            self.attach(&entry.handle);
        }
    }

    /// Flush the entire LRU to disk through the normal commit machinery,
    /// then drop every pooled buffer.
    pub fn clear(&self) -> Result<()> {
        let result = {
            let _guard = EvictGuard::claim(&self.evict_ok);
            let mut batch = PendingBatch::new();
            let mut result = Ok(());
            loop {
                let popped = self.lru.borrow_mut().pop_back();
                let Some(tail) = popped else { break };
                tail.inner.borrow_mut().slot = None;
                if let Err(e) = self.finalize_sector(&tail, &mut batch) {
                    self.attach(&tail);
                    self.restore_batch(std::mem::take(&mut batch));
                    result = Err(e);
                    break;
                }
            }
            match result {
                Ok(()) => self.commit_batch(batch),
                err => err,
            }
        };
        if result.is_ok() {
            self.pool.borrow_mut().clear();
        }
        result
    }

    /// Drop the entire LRU without writing anything: finalizers run, but
    /// deferred writes are discarded and their sectors freed. For
    /// shutdown and reformat paths.
    pub fn purge(&self) {
        let _guard = EvictGuard::claim(&self.evict_ok);
        let mut batch = PendingBatch::new();
        loop {
            let popped = self.lru.borrow_mut().pop_back();
            let Some(tail) = popped else { break };
            tail.inner.borrow_mut().slot = None;
            if self.finalize_sector(&tail, &mut batch).is_err() {
                self.unallocate(&tail);
            }
        }
        for entry in batch {
            drop(entry.write);
            self.unallocate(&entry.handle);
        }
        self.pool.borrow_mut().clear();
    }

    // ----- raw page I/O -----

    pub(crate) fn read_page(&self, id: PageId, buf: &mut PageBuf) -> Result<()> {
        self.disk.read(id.get(), std::slice::from_mut(buf))
    }

    pub(crate) fn write_page(&self, id: PageId, buf: &PageBuf) -> Result<()> {
        self.disk.write(id.get(), std::slice::from_ref(buf))
    }

    pub(crate) fn pool_take(&self) -> PageBuf {
        self.pool.borrow_mut().take()
    }

    pub(crate) fn pool_put(&self, buf: PageBuf) {
        self.pool.borrow_mut().release_one(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BumpAllocator;
    use crate::checksum::NoChecksum;
    use crate::disk::MemDisk;

    const PAGE: usize = 128;

    fn test_ctx(sectors: u64, max: usize, min: usize) -> (Rc<MemDisk>, Rc<Context>) {
        let disk = Rc::new(MemDisk::new(PAGE as u32, sectors));
        let mut opts = Options::new();
        opts.max_lru_size(max).min_lru_size(min);
        let ctx = Context::new(
            Box::new(disk.clone()),
            Rc::new(NoChecksum),
            Box::new(BumpAllocator::new(sectors)),
            opts,
        );
        (disk, ctx)
    }

    /// A finalizer that defers the write to the batch, like tree pages do.
    fn deferred(h: &SectorHandle, height: u16) -> FinalizeFn {
        let h = h.clone();
        Rc::new(move |_ctx: &Context, _batch: &mut PendingBatch| {
            let target = h.clone();
            Ok(Finalize::Pending {
                height,
                write: Box::new(move |ctx, id| Ok(ctx.seal(&target, id))),
            })
        })
    }

    fn marked_page(ctx: &Context, mark: u8) -> Result<SectorHandle> {
        let h = ctx.allocate_attached()?;
        ctx.buf(&h).fill(mark);
        let fin = deferred(&h, 0);
        ctx.set_finalize(&h, fin);
        Ok(h)
    }

    #[test]
    fn eviction_commits_and_pages_fault_back_in() {
        let (disk, ctx) = test_ctx(64, 4, 2);
        let pages: Vec<_> = (0..6)
            .map(|i| marked_page(&ctx, i as u8 + 1).unwrap())
            .collect();

        // allocating past the bound evicted down to the soft minimum
        assert!(ctx.stats().lru_len <= 4);
        let evicted: Vec<_> = pages
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.on_disk_id().map(|id| (i, id)))
            .collect();
        assert!(!evicted.is_empty());

        for (i, id) in &evicted {
            // the committed image is on disk at the recorded id
            let mut buf = vec![PageBuf::zeroed(PAGE)];
            disk.read(id.get(), &mut buf).unwrap();
            assert!(buf[0].iter().all(|&b| b == *i as u8 + 1));
            assert!(!id.is_reserved());
        }

        // faulting back in restores the bytes and recycles the id
        let (i, id) = evicted[0];
        assert_eq!(ctx.fault_in(&pages[i]).unwrap(), Some(id));
        assert!(ctx.buf(&pages[i]).iter().all(|&b| b == i as u8 + 1));
        let drained = ctx.acquire_discarded();
        assert!(drained
            .iter()
            .any(|r| r.base.get() <= id.get() && id.get() < r.base.get() + r.len));
    }

    #[test]
    fn unevictable_tail_blocks_eviction() {
        let (_disk, ctx) = test_ctx(64, 4, 2);
        // no finalizers: nothing can be evicted
        let _pages: Vec<_> = (0..4).map(|_| ctx.allocate_attached().unwrap()).collect();
        let extra = ctx.allocate_attached().unwrap();
        ctx.buf(&extra).fill(9);
        // the cache overflows rather than evicting unevictable pages
        assert_eq!(ctx.stats().lru_len, 5);
    }

    #[test]
    fn deeper_pages_commit_before_shallower() {
        let (disk, ctx) = test_ctx(64, 8, 2);
        // heights 2, 0, 1 in LRU order; commit order must be 0, 1, 2
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut handles = Vec::new();
        for height in [2u16, 0, 1] {
            let h = ctx.allocate_attached().unwrap();
            ctx.buf(&h).fill(height as u8 + 1);
            let fin: FinalizeFn = {
                let target = h.clone();
                let order = order.clone();
                Rc::new(move |_ctx: &Context, _batch: &mut PendingBatch| {
                    let target = target.clone();
                    let order = order.clone();
                    Ok(Finalize::Pending {
                        height,
                        write: Box::new(move |ctx, id| {
                            order.borrow_mut().push(height);
                            Ok(ctx.seal(&target, id))
                        }),
                    })
                })
            };
            ctx.set_finalize(&h, fin);
            handles.push(h);
        }
        ctx.clear().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);

        for h in &handles {
            let id = h.on_disk_id().unwrap();
            let mut buf = vec![PageBuf::zeroed(PAGE)];
            disk.read(id.get(), &mut buf).unwrap();
            assert!(buf[0][0] != 0);
        }
    }

    #[test]
    fn clear_flushes_everything_and_empties_the_pool() {
        let (disk, ctx) = test_ctx(64, 8, 2);
        let pages: Vec<_> = (0..5)
            .map(|i| marked_page(&ctx, i as u8 + 1).unwrap())
            .collect();
        ctx.clear().unwrap();

        let stats = ctx.stats();
        assert_eq!(stats.lru_len, 0);
        assert_eq!(stats.pool_available, 0);
        assert_eq!(stats.in_memory, 0);
        for (i, h) in pages.iter().enumerate() {
            let id = h.on_disk_id().expect("clear writes every resident page");
            let mut buf = vec![PageBuf::zeroed(PAGE)];
            disk.read(id.get(), &mut buf).unwrap();
            assert!(buf[0].iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[test]
    fn purge_writes_nothing() {
        let (disk, ctx) = test_ctx(64, 8, 2);
        let pages: Vec<_> = (0..3)
            .map(|i| marked_page(&ctx, i as u8 + 1).unwrap())
            .collect();
        ctx.purge();

        assert_eq!(ctx.stats().lru_len, 0);
        assert_eq!(ctx.stats().pool_available, 0);
        assert!(pages.iter().all(|h| h.on_disk_id().is_none()));
        // no data page was ever written
        let mut buf = vec![PageBuf::zeroed(PAGE)];
        for id in 2..10u64 {
            disk.read(id, &mut buf).unwrap();
            assert!(buf[0].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn allocator_exhaustion_leaves_the_lru_consistent() {
        use crate::error::Error;

        // 4 allocatable ids, but more pages than that to spill
        let (_disk, ctx) = test_ctx(6, 4, 2);
        let mut pages = Vec::new();
        let mut failed = false;
        for i in 0..8 {
            match marked_page(&ctx, i as u8 + 1) {
                Ok(h) => pages.push(h),
                Err(Error::DiskIsFull) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(failed);
        // the aborted eviction reattached everything it had popped
        assert_eq!(ctx.stats().lru_len, 4);
        for h in &pages {
            assert!(h.is_in_memory() || h.on_disk_id().is_some());
        }
    }

    #[test]
    fn pool_stays_within_its_bound() {
        let (_disk, ctx) = test_ctx(128, 4, 2);
        for round in 0..8 {
            let pages: Vec<_> = (0..4)
                .map(|i| marked_page(&ctx, (round * 4 + i) as u8 + 1).unwrap())
                .collect();
            for h in pages {
                ctx.unallocate(&h);
            }
            let stats = ctx.stats();
            assert!(stats.pool_available + stats.in_memory <= 4 + 1);
        }
    }

    #[test]
    fn set_id_releases_the_buffer_and_retires_the_sector() {
        let (_disk, ctx) = test_ctx(64, 4, 2);
        let h = marked_page(&ctx, 7).unwrap();
        let before = ctx.stats();
        ctx.set_id(&h, PageId(42));
        let after = ctx.stats();
        assert_eq!(h.on_disk_id(), Some(PageId(42)));
        assert_eq!(after.in_memory, before.in_memory - 1);
        assert_eq!(after.pool_available, before.pool_available + 1);
        assert_eq!(after.lru_len, before.lru_len - 1);
        // retired sectors never rejoin the LRU
        ctx.fault_in(&h).unwrap();
        assert_eq!(ctx.stats().lru_len, after.lru_len);
    }

    #[test]
    #[should_panic(expected = "access to freed sector")]
    fn touching_a_freed_sector_panics() {
        let (_disk, ctx) = test_ctx(64, 4, 2);
        let h = ctx.allocate();
        ctx.unallocate(&h);
        let _ = ctx.buf(&h);
    }

    #[test]
    #[should_panic(expected = "eviction re-entered")]
    fn reentrant_eviction_panics() {
        let (_disk, ctx) = test_ctx(64, 4, 2);
        let h = ctx.allocate_attached().unwrap();
        let reenter: FinalizeFn = Rc::new(move |ctx: &Context, _batch: &mut PendingBatch| {
            ctx.make_room()?;
            unreachable!()
        });
        ctx.set_finalize(&h, reenter);
        // fill the cache so the next allocation must evict
        let _pages: Vec<_> = (0..4).map(|i| marked_page(&ctx, i as u8 + 1).unwrap()).collect();
        let _ = ctx.allocate_attached();
    }
}
