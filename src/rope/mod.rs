//! A persistent variable-length byte container.
//!
//! The rope is a height-balanced tree of cached pages: leaves hold raw
//! byte runs, interior nodes hold `(cumulative size, child pointer)`
//! entries. Height only ever grows at the root. Nodes reference children
//! downward only — by cache handle while materialized, by on-page id
//! otherwise — so there are no cycles and no parent pointers; the
//! rightmost-spine size updates ride the append recursion instead.
//!
//! The rope cooperates with cache eviction: every non-root node carries
//! a finalizer which funnels still-resident children into the same
//! commit batch, so a parent page is never serialized before its
//! children have ids.

use crate::cache::{Context, Finalize, PendingBatch, SectorHandle};
use crate::error::{Error, Result};
use crate::page_id::PageId;
use crate::pool::PageBuf;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

mod layout;

fn leaf_capacity(ctx: &Context) -> usize {
    ctx.page_size() - layout::HEADER_SIZE - ctx.checksum().digest_size()
}

fn max_children(ctx: &Context) -> usize {
    let body = ctx.page_size() - layout::HEADER_SIZE - ctx.checksum().digest_size();
    body / (layout::KEY_SIZE + ctx.id_codec().width())
}

fn verify_digest(ctx: &Context, page: &[u8], id: PageId) -> Result<()> {
    let digest_size = ctx.checksum().digest_size();
    if digest_size == 0 {
        return Ok(());
    }
    let end = page.len() - digest_size;
    if ctx.checksum().compute(&page[..end])[..] != page[end..] {
        return Err(Error::InvalidChecksum(id));
    }
    Ok(())
}

struct NodeInner {
    elt: SectorHandle,
    height: u16,
    /// Materialized children by index. `None` means the child is known
    /// only by the pointer stored in the page.
    children: RefCell<Vec<Option<Node>>>,
}

#[derive(Clone)]
struct Node(Rc<NodeInner>);

impl Node {
    /// A fresh pinned node; used for roots.
    fn new_detached(ctx: &Context, height: u16) -> Node {
        let elt = ctx.allocate();
        ctx.pin(&elt);
        {
            let mut page = ctx.buf(&elt);
            layout::set_height(&mut page, height);
            layout::set_count(&mut page, 0);
        }
        Self::wrap(ctx, elt, height)
    }

    /// A fresh evictable node.
    fn new_attached(ctx: &Context, height: u16) -> Result<Node> {
        let elt = ctx.allocate_attached()?;
        {
            let mut page = ctx.buf(&elt);
            layout::set_height(&mut page, height);
            layout::set_count(&mut page, 0);
        }
        Ok(Self::wrap(ctx, elt, height))
    }

    /// A node referencing an existing on-disk page; nothing is read
    /// until the page is first touched.
    fn from_id(ctx: &Context, id: PageId, height: u16) -> Node {
        Self::wrap(ctx, ctx.from_id(id), height)
    }

    fn wrap(ctx: &Context, elt: SectorHandle, height: u16) -> Node {
        let inner = Rc::new(NodeInner {
            elt,
            height,
            children: RefCell::new(Vec::new()),
        });
        Self::register_finalizer(ctx, &inner);
        Node(inner)
    }

    fn register_finalizer(ctx: &Context, inner: &Rc<NodeInner>) {
        let weak = Rc::downgrade(inner);
        ctx.set_finalize(
            &inner.elt,
            Rc::new(move |ctx: &Context, batch: &mut PendingBatch| {
                // UPGRADE: evictable nodes stay rooted through their
                // parent chain up to the pinned root.
                let node = weak.upgrade().expect("rope node dropped while evictable");
                if node.height > 0 {
                    let children = node.children.borrow();
                    for child in children.iter().flatten() {
                        ctx.finalize_sector(&child.0.elt, batch)?;
                    }
                }
                let target = weak.clone();
                Ok(Finalize::Pending {
                    height: node.height,
                    write: Box::new(move |ctx, id| seal_node(ctx, &target, id)),
                })
            }),
        );
    }

    /// Ensure the page is resident, verifying its checksum when it
    /// comes in from disk.
    fn load(&self, ctx: &Context) -> Result<()> {
        if let Some(id) = ctx.fault_in(&self.0.elt)? {
            let page = ctx.buf(&self.0.elt);
            verify_digest(ctx, &page, id)?;
        }
        Ok(())
    }

    fn ensure_children(&self, len: usize) {
        let mut children = self.0.children.borrow_mut();
        if children.len() < len {
            children.resize(len, None);
        }
    }

    /// Materialize child `i`, replacing a handle that was spent by an
    /// earlier commit with a fresh by-id reference.
    fn child(&self, ctx: &Context, i: usize) -> Result<Node> {
        self.load(ctx)?;
        let count = { layout::count(&ctx.buf(&self.0.elt)) as usize };
        assert!(i < count, "child index {} out of {}", i, count);
        self.ensure_children(count);

        let existing = self.0.children.borrow()[i].clone();
        if let Some(node) = existing {
            match node.0.elt.retired_id() {
                None => return Ok(node),
                Some(id) => {
                    let fresh = Node::from_id(ctx, id, self.0.height - 1);
                    self.0.children.borrow_mut()[i] = Some(fresh.clone());
                    return Ok(fresh);
                }
            }
        }

        let id = { layout::child_ptr(&ctx.buf(&self.0.elt), ctx.id_codec(), i) };
        assert!(!id.is_nil(), "unmaterialized child has a nil pointer");
        let node = Node::from_id(ctx, id, self.0.height - 1);
        self.0.children.borrow_mut()[i] = Some(node.clone());
        Ok(node)
    }

    /// Byte size of the subtree: leaf length, or the last cumulative key.
    fn size(&self, ctx: &Context) -> Result<u64> {
        self.load(ctx)?;
        let page = ctx.buf(&self.0.elt);
        Ok(if self.0.height == 0 {
            u64::from(layout::count(&page))
        } else {
            match layout::count(&page) as usize {
                0 => 0,
                n => u64::from(layout::key(&page, ctx.id_codec(), n - 1)),
            }
        })
    }

    /// Record a new rightmost child with a nil pointer and an unchanged
    /// cumulative key.
    fn push_child(&self, ctx: &Context, child: Node) -> Result<()> {
        self.load(ctx)?;
        let codec = ctx.id_codec();
        {
            let mut page = ctx.buf(&self.0.elt);
            let n = layout::count(&page) as usize;
            assert!(n < max_children(ctx), "interior node has no room");
            let key = if n == 0 {
                0
            } else {
                layout::key(&page, codec, n - 1)
            };
            layout::set_count(&mut page, (n + 1) as u16);
            layout::set_key(&mut page, codec, n, key);
            layout::set_child_ptr(&mut page, codec, n, PageId::NIL);
            self.ensure_children(n);
        }
        self.0.children.borrow_mut().push(Some(child));
        Ok(())
    }

    fn bump_last_key(&self, ctx: &Context, delta: u32) {
        let codec = ctx.id_codec();
        let mut page = ctx.buf(&self.0.elt);
        let n = layout::count(&page) as usize;
        debug_assert!(n > 0);
        let key = layout::key(&page, codec, n - 1);
        layout::set_key(&mut page, codec, n - 1, key + delta);
    }

    /// An empty path of nodes from `height` down to a leaf.
    fn new_spine(ctx: &Context, height: u16) -> Result<Node> {
        let top = Node::new_attached(ctx, height)?;
        let mut cursor = top.clone();
        for h in (0..height).rev() {
            let child = Node::new_attached(ctx, h)?;
            cursor.push_child(ctx, child.clone())?;
            cursor = child;
        }
        Ok(top)
    }

    /// Push bytes into the rightmost leaf of this subtree, adding
    /// siblings while there is room. Returns the number of bytes
    /// consumed and whether the subtree is full: a full subtree makes no
    /// further progress and the caller must grow upward.
    fn do_append(&self, ctx: &Context, bytes: &[u8], start: usize) -> Result<(usize, bool)> {
        self.load(ctx)?;
        if self.0.height == 0 {
            let capacity = leaf_capacity(ctx);
            let mut page = ctx.buf(&self.0.elt);
            let len = layout::count(&page) as usize;
            let take = (capacity - len).min(bytes.len() - start);
            if take > 0 {
                let at = layout::HEADER_SIZE + len;
                page[at..at + take].copy_from_slice(&bytes[start..start + take]);
                layout::set_count(&mut page, (len + take) as u16);
            }
            return Ok((take, len + take == capacity));
        }

        let mut pos = start;
        loop {
            self.load(ctx)?;
            let count = { layout::count(&ctx.buf(&self.0.elt)) as usize };
            if count == 0 {
                let child = Node::new_spine(ctx, self.0.height - 1)?;
                self.push_child(ctx, child)?;
                continue;
            }
            let child = self.child(ctx, count - 1)?;
            let (consumed, full) = child.do_append(ctx, bytes, pos)?;
            if consumed > 0 {
                self.load(ctx)?;
                self.bump_last_key(ctx, consumed as u32);
                pos += consumed;
            }
            if !full {
                return Ok((pos - start, false));
            }
            if count == max_children(ctx) {
                return Ok((pos - start, true));
            }
            let sibling = Node::new_spine(ctx, self.0.height - 1)?;
            self.load(ctx)?;
            self.push_child(ctx, sibling)?;
        }
    }

    /// Copy bytes at `offset` within this subtree into `out`, left to
    /// right. Returns how many bytes were produced; fewer than
    /// `out.len()` means the subtree ended.
    fn do_read(&self, ctx: &Context, offset: u64, out: &mut [u8]) -> Result<usize> {
        self.load(ctx)?;
        if self.0.height == 0 {
            let page = ctx.buf(&self.0.elt);
            let len = u64::from(layout::count(&page));
            if offset >= len {
                return Ok(0);
            }
            let take = out.len().min((len - offset) as usize);
            let at = layout::HEADER_SIZE + offset as usize;
            out[..take].copy_from_slice(&page[at..at + take]);
            return Ok(take);
        }

        let codec = ctx.id_codec();
        let count = { layout::count(&ctx.buf(&self.0.elt)) as usize };
        let mut done = 0usize;
        let mut child_start = 0u64;
        for i in 0..count {
            if done == out.len() {
                break;
            }
            let pos = offset + done as u64;
            self.load(ctx)?;
            let child_end = { u64::from(layout::key(&ctx.buf(&self.0.elt), codec, i)) };
            if child_end <= pos {
                child_start = child_end;
                continue;
            }
            let child = self.child(ctx, i)?;
            debug_assert!(pos >= child_start);
            done += child.do_read(ctx, pos - child_start, &mut out[done..])?;
            child_start = child_end;
        }
        Ok(done)
    }

    /// The in-place counterpart of [`Node::do_read`]: overwrite bytes at
    /// `offset` from `src`, never changing any size.
    fn do_write(&self, ctx: &Context, offset: u64, src: &[u8]) -> Result<usize> {
        self.load(ctx)?;
        if self.0.height == 0 {
            let mut page = ctx.buf(&self.0.elt);
            let len = u64::from(layout::count(&page));
            if offset >= len {
                return Ok(0);
            }
            let put = src.len().min((len - offset) as usize);
            let at = layout::HEADER_SIZE + offset as usize;
            page[at..at + put].copy_from_slice(&src[..put]);
            return Ok(put);
        }

        let codec = ctx.id_codec();
        let count = { layout::count(&ctx.buf(&self.0.elt)) as usize };
        let mut done = 0usize;
        let mut child_start = 0u64;
        for i in 0..count {
            if done == src.len() {
                break;
            }
            let pos = offset + done as u64;
            self.load(ctx)?;
            let child_end = { u64::from(layout::key(&ctx.buf(&self.0.elt), codec, i)) };
            if child_end <= pos {
                child_start = child_end;
                continue;
            }
            let child = self.child(ctx, i)?;
            debug_assert!(pos >= child_start);
            done += child.do_write(ctx, pos - child_start, &src[done..])?;
            child_start = child_end;
        }
        Ok(done)
    }

    /// Post-order discard of the whole subtree.
    fn free(ctx: &Context, node: &Node) -> Result<()> {
        if node.0.height > 0 {
            node.load(ctx)?;
            let count = { layout::count(&ctx.buf(&node.0.elt)) as usize };
            for i in 0..count {
                let child = node.child(ctx, i)?;
                Node::free(ctx, &child)?;
            }
        }
        ctx.drop_release(&node.0.elt);
        Ok(())
    }

    /// Verify this subtree: on-disk parts are walked and checked page by
    /// page; resident pages have no digest yet and are skipped, but
    /// their on-disk descendants are still visited.
    fn verify(ctx: &Context, node: &Node) -> Result<()> {
        if let Some(id) = node.0.elt.on_disk_id() {
            return Self::verify_from(ctx, id, node.0.height);
        }
        if node.0.height == 0 {
            return Ok(());
        }
        let codec = ctx.id_codec();
        let count = { layout::count(&ctx.buf(&node.0.elt)) as usize };
        node.ensure_children(count);
        for i in 0..count {
            let existing = node.0.children.borrow()[i].clone();
            match existing {
                Some(child) => Self::verify(ctx, &child)?,
                None => {
                    let id = { layout::child_ptr(&ctx.buf(&node.0.elt), codec, i) };
                    if !id.is_nil() {
                        Self::verify_from(ctx, id, node.0.height - 1)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_from(ctx: &Context, id: PageId, height: u16) -> Result<()> {
        let mut buf = ctx.pool_take();
        let result = Self::verify_page(ctx, id, height, &mut buf);
        ctx.pool_put(buf);
        result
    }

    fn verify_page(ctx: &Context, id: PageId, height: u16, buf: &mut PageBuf) -> Result<()> {
        ctx.read_page(id, buf)?;
        verify_digest(ctx, buf, id)?;
        debug_assert_eq!(layout::height(buf), height);
        if height > 0 {
            let codec = ctx.id_codec();
            let count = layout::count(buf) as usize;
            for i in 0..count {
                let child = layout::child_ptr(buf, codec, i);
                if !child.is_nil() {
                    Self::verify_from(ctx, child, height - 1)?;
                }
            }
        }
        Ok(())
    }
}

/// Serialize one node for the id assigned by the batch commit: patch the
/// pointer fields of materialized children (already committed, since
/// lower heights seal first), stamp the digest, and surrender the page.
fn seal_node(ctx: &Context, target: &Weak<NodeInner>, id: PageId) -> Result<PageBuf> {
    let node = target.upgrade().expect("rope node dropped during commit");
    if node.height > 0 {
        let codec = ctx.id_codec();
        let mut children = node.children.borrow_mut();
        let mut page = ctx.buf(&node.elt);
        for (i, slot) in children.iter_mut().enumerate() {
            let Some(child) = slot.take() else { continue };
            let child_id = child
                .0
                .elt
                .on_disk_id()
                .expect("children are sealed before their parent");
            layout::set_child_ptr(&mut page, codec, i, child_id);
        }
    }
    let digest_size = ctx.checksum().digest_size();
    if digest_size > 0 {
        let mut page = ctx.buf(&node.elt);
        let end = page.len() - digest_size;
        let digest = ctx.checksum().compute(&page[..end]);
        page[end..].copy_from_slice(&digest);
    }
    Ok(ctx.seal(&node.elt, id))
}

/// A persistent variable-length byte array stored as a tree of pages.
pub struct Rope {
    ctx: Rc<Context>,
    root: Node,
}

impl Rope {
    /// An empty rope: a single zero-length leaf.
    pub fn create(ctx: &Rc<Context>) -> Rope {
        Rope {
            ctx: ctx.clone(),
            root: Node::new_detached(ctx, 0),
        }
    }

    /// Load a rope from its committed root page. The nil pointer yields
    /// a fresh empty rope.
    pub fn load(ctx: &Rc<Context>, root: PageId) -> Result<Rope> {
        if root.is_nil() {
            return Ok(Self::create(ctx));
        }
        let elt = ctx.from_id(root);
        ctx.pin(&elt);
        ctx.fault_in(&elt)?;
        let height = {
            let page = ctx.buf(&elt);
            verify_digest(ctx, &page, root)?;
            layout::height(&page)
        };
        let inner = Rc::new(NodeInner {
            elt,
            height,
            children: RefCell::new(Vec::new()),
        });
        Node::register_finalizer(ctx, &inner);
        Ok(Rope {
            ctx: ctx.clone(),
            root: Node(inner),
        })
    }

    /// Build a rope holding `bytes`.
    pub fn from_bytes(ctx: &Rc<Context>, bytes: &[u8]) -> Result<Rope> {
        let mut rope = Self::create(ctx);
        rope.append(bytes)?;
        Ok(rope)
    }

    /// Total byte length.
    pub fn size(&self) -> Result<u64> {
        self.root.size(&self.ctx)
    }

    /// Height of the root node; 0 for a single-leaf rope.
    pub fn height(&self) -> u16 {
        self.root.0.height
    }

    /// Append `bytes` at the end, growing the tree upward as needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut pos = 0;
        loop {
            let (consumed, full) = self.root.do_append(&self.ctx, bytes, pos)?;
            pos += consumed;
            if !full {
                debug_assert_eq!(pos, bytes.len());
                return Ok(());
            }
            self.grow()?;
        }
    }

    /// The current root becomes the first child of a new, taller root.
    fn grow(&mut self) -> Result<()> {
        let old = self.root.clone();
        let old_size = old.size(&self.ctx)?;
        let height = old.0.height + 1;
        let new_root = Node::new_detached(&self.ctx, height);
        {
            let codec = self.ctx.id_codec();
            let mut page = self.ctx.buf(&new_root.0.elt);
            layout::set_count(&mut page, 1);
            layout::set_key(&mut page, codec, 0, old_size as u32);
            layout::set_child_ptr(&mut page, codec, 0, PageId::NIL);
        }
        new_root.0.children.borrow_mut().push(Some(old.clone()));
        self.ctx.unpin(&old.0.elt);
        self.ctx.attach(&old.0.elt);
        self.root = new_root;
        tracing::trace!(height, "rope grew in height");
        Ok(())
    }

    /// Read up to `dst.len()` bytes starting at `offset`. Returns the
    /// number of bytes read, which falls short only when the rope ends.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        self.root.do_read(&self.ctx, offset, dst)
    }

    /// Overwrite bytes starting at `offset`. The portion extending past
    /// the current size is appended. `offset` itself must not exceed the
    /// current size.
    pub fn write_at(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        let size = self.size()?;
        assert!(offset <= size, "write starts past the end of the rope");
        let in_bounds = src.len().min((size - offset) as usize);
        if in_bounds > 0 {
            let written = self.root.do_write(&self.ctx, offset, &src[..in_bounds])?;
            debug_assert_eq!(written, in_bounds);
        }
        if in_bounds < src.len() {
            self.append(&src[in_bounds..])?;
        }
        Ok(())
    }

    /// The whole rope as a byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let size = self.size()? as usize;
        let mut out = vec![0u8; size];
        let read = self.read_at(0, &mut out)?;
        debug_assert_eq!(read, size);
        Ok(out)
    }

    /// Commit the rope: every dirty page is written and the root's page
    /// id is returned for recording in a directory or superblock.
    pub fn commit(&mut self) -> Result<PageId> {
        let mut batch = PendingBatch::new();
        self.ctx.finalize_sector(&self.root.0.elt, &mut batch)?;
        self.ctx.commit_batch(batch)?;
        Ok(self
            .root
            .0
            .elt
            .on_disk_id()
            .expect("root sealed by commit"))
    }

    /// Discard the rope: every page id the tree owns is handed to the
    /// discarded set and every resident buffer returns to the pool.
    pub fn free(self) -> Result<()> {
        Node::free(&self.ctx, &self.root)
    }

    /// Recursively verify the checksum of every committed page.
    pub fn verify_checksums(&self) -> Result<()> {
        Node::verify(&self.ctx, &self.root)
    }

    /// Cumulative keys of the root node, for inspection in tests; the
    /// empty vector for a leaf root.
    #[doc(hidden)]
    pub fn root_keys(&self) -> Result<Vec<u64>> {
        self.root.load(&self.ctx)?;
        let codec = self.ctx.id_codec();
        let page = self.ctx.buf(&self.root.0.elt);
        if self.root.0.height == 0 {
            return Ok(Vec::new());
        }
        let count = layout::count(&page) as usize;
        Ok((0..count)
            .map(|i| u64::from(layout::key(&page, codec, i)))
            .collect())
    }
}
