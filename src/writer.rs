//! Summary: Copy-on-write B+ tree batch writer.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The writer applies a strictly ascending stream of `(key, value)` pairs
//! (`None` deletes) to an existing tree version and produces a new root
//! page. No page referenced by a live snapshot is mutated: touched leaves
//! are patched in memory and re-emitted to fresh blocks, their ancestors
//! are rewritten bottom-up, and every superseded block is recycled into
//! the store's checkpointed free structure.
//!
//! Memory is bounded: when the loaded-page budget is exceeded at a leaf
//! boundary, completed patches are flushed into a partial new tree whose
//! root becomes the working root, and the batch resumes seeking from it.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::overflow;
use crate::page::{self, BranchItemBuf, LeafItemBuf, PageRef, SlotBuf};
use crate::snapshot::Root;
use crate::store::Heap;
use crate::task;

/// Default bound on pages buffered by one batch.
pub const DEFAULT_MAX_LOADED_PAGES: usize = 64;

/// One step of the descent: the page at that depth, which child index was
/// taken, and how many items the page held.
#[derive(Debug, Clone)]
struct PathSlot {
    /// Block id of the page at this depth; 0 marks the in-memory root.
    block_id: u32,
    index: usize,
    count: usize,
}

/// The leaf currently receiving writes.
struct OpenLeaf {
    /// Branch levels from the root down to the leaf's parent.
    path: Vec<PathSlot>,
    items: Vec<LeafItemBuf>,
    /// Window bound: keys at most this separator belong to this leaf.
    /// `None` when the leaf is rightmost at every level.
    upper: Option<SlotBuf>,
    /// The superseded on-disk leaf, 0 when the root itself is the leaf.
    orig_block: u32,
    dirty: bool,
}

/// A finished leaf patch awaiting the rebuild pass.
struct Patch {
    path: Vec<PathSlot>,
    items: Vec<LeafItemBuf>,
}

/// A run of replacement branch items for one original child entry.
struct Repl {
    path: Vec<PathSlot>,
    items: Vec<BranchItemBuf>,
}

enum LevelItems {
    Leaf(Vec<LeafItemBuf>),
    Branch(Vec<BranchItemBuf>),
}

/// Applies `batch` to `root`, returning the new root page and height.
///
/// Keys must arrive strictly ascending with no duplicates; `None` values
/// delete. On failure every block the batch allocated is recycled before
/// the error returns; the caller then rolls the store back.
pub fn apply<H, I>(
    heap: &H,
    root: &Root,
    batch: I,
    max_loaded_pages: usize,
) -> Result<(Vec<u8>, u32)>
where
    H: Heap + ?Sized,
    I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
    let mut writer = BatchWriter {
        heap,
        page_size: heap.page_size(),
        key_inline: root.key_inline,
        val_inline: root.val_inline,
        max_loaded: max_loaded_pages.max(8),
        root_page: root.page.as_ref().clone(),
        height: root.height,
        branches: HashMap::new(),
        cur: None,
        done: Vec::new(),
        allocated: Vec::new(),
    };
    match writer.run(batch) {
        Ok(()) => Ok((writer.root_page, writer.height)),
        Err(e) => {
            writer.unwind();
            Err(e)
        }
    }
}

struct BatchWriter<'h, H: Heap + ?Sized> {
    heap: &'h H,
    page_size: usize,
    key_inline: usize,
    val_inline: usize,
    max_loaded: usize,
    root_page: Vec<u8>,
    height: u32,
    /// Branch pages faulted in during seeks, keyed by block id.
    branches: HashMap<u32, Vec<u8>>,
    cur: Option<OpenLeaf>,
    done: Vec<Patch>,
    /// Every block this batch allocated, for error unwind.
    allocated: Vec<u32>,
}

impl<'h, H: Heap + ?Sized> BatchWriter<'h, H> {
    fn run<I>(&mut self, batch: I) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    {
        let mut last_key: Option<Vec<u8>> = None;
        for (key, val) in batch {
            if let Some(prev) = &last_key {
                if key.as_slice() <= prev.as_slice() {
                    return Err(Error::OutOfRange {
                        what: "batch keys not strictly ascending",
                    });
                }
            }
            self.write(&key, val)?;
            last_key = Some(key);
        }
        self.close_current()?;
        self.rebuild()
    }

    fn write(&mut self, key: &[u8], val: Option<Vec<u8>>) -> Result<()> {
        if !self.in_window(key)? {
            self.advance_to(key)?;
        }
        let (found, idx) = {
            let leaf = self.cur.as_ref().expect("leaf open after advance");
            find(self.heap, &leaf.items, key)?
        };

        match (found, val) {
            (true, Some(v)) => {
                let old = self.cur.as_ref().expect("open").items[idx].val.overflow;
                if let Some((_, first)) = old {
                    overflow::recycle(self.heap, first)?;
                }
                let slot = self.make_slot(&v, self.val_inline)?;
                let leaf = self.cur.as_mut().expect("open");
                leaf.items[idx].val = slot;
                leaf.dirty = true;
            }
            (true, None) => {
                let item = {
                    let leaf = self.cur.as_mut().expect("open");
                    leaf.dirty = true;
                    leaf.items.remove(idx)
                };
                if let Some((_, first)) = item.key.overflow {
                    overflow::recycle(self.heap, first)?;
                }
                if let Some((_, first)) = item.val.overflow {
                    overflow::recycle(self.heap, first)?;
                }
            }
            (false, Some(v)) => {
                let key_slot = self.make_slot(key, self.key_inline)?;
                let val_slot = self.make_slot(&v, self.val_inline)?;
                let leaf = self.cur.as_mut().expect("open");
                leaf.items.insert(
                    idx,
                    LeafItemBuf {
                        key: key_slot,
                        val: val_slot,
                    },
                );
                leaf.dirty = true;
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// True when `key` belongs to the currently open leaf's window.
    fn in_window(&self, key: &[u8]) -> Result<bool> {
        match &self.cur {
            None => Ok(false),
            Some(leaf) => match &leaf.upper {
                None => Ok(true),
                Some(upper) => Ok(overflow::compare_slot(
                    self.heap,
                    key,
                    &upper.prefix,
                    upper.overflow,
                )? != Ordering::Greater),
            },
        }
    }

    fn advance_to(&mut self, key: &[u8]) -> Result<()> {
        self.close_current()?;
        if self.loaded_pages() > self.max_loaded {
            self.rebuild()?;
        }
        self.seek(key)
    }

    fn loaded_pages(&self) -> usize {
        self.branches.len() + self.done.len() + 1
    }

    /// Closes the open leaf; a dirty one becomes a patch and its old
    /// block is recycled.
    fn close_current(&mut self) -> Result<()> {
        if let Some(leaf) = self.cur.take() {
            if leaf.dirty {
                if leaf.orig_block != 0 {
                    self.heap.recycle(leaf.orig_block)?;
                }
                self.done.push(Patch {
                    path: leaf.path,
                    items: leaf.items,
                });
            }
        }
        Ok(())
    }

    /// Descends from the working root to the leaf owning `key`, faulting
    /// branch pages into the cache and recording the level vector.
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let mut upper: Option<SlotBuf> = None;
        let mut path: Vec<PathSlot> = Vec::new();

        if self.height == 0 {
            let items = PageRef::parse(&self.root_page)?.leaf_items()?;
            self.cur = Some(OpenLeaf {
                path,
                items,
                upper: None,
                orig_block: 0,
                dirty: false,
            });
            return Ok(());
        }

        let mut block_id = 0u32;
        for depth in 0..self.height {
            let (child, idx, count, sep) = {
                let bytes: &[u8] = if depth == 0 {
                    &self.root_page
                } else {
                    &self.branches[&block_id][..self.page_size]
                };
                let parsed = PageRef::parse(bytes)?;
                let count = parsed.count();
                if count == 0 {
                    return Err(Error::OutOfRange {
                        what: "empty branch page",
                    });
                }
                // First separator the key is not greater than.
                let mut lo = 0usize;
                let mut hi = count;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let item = parsed.branch_item(mid)?;
                    let ord = overflow::compare_slot(
                        self.heap,
                        key,
                        item.key.prefix,
                        item.key.overflow,
                    )?;
                    if ord == Ordering::Greater {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                let (idx, sep) = if lo < count {
                    let item = parsed.branch_item(lo)?;
                    (lo, Some(item.key.to_buf()))
                } else {
                    (count - 1, None)
                };
                (parsed.branch_item(idx)?.child, idx, count, sep)
            };
            if let Some(s) = sep {
                upper = Some(s);
            }
            path.push(PathSlot {
                block_id,
                index: idx,
                count,
            });

            if depth + 1 < self.height {
                if !self.branches.contains_key(&child) {
                    let mut buf = self.heap.allocate_buffer();
                    self.heap.read_block(child, &mut buf)?;
                    self.branches.insert(child, buf);
                }
                block_id = child;
            } else {
                let mut buf = self.heap.allocate_buffer();
                let res = self
                    .heap
                    .read_block(child, &mut buf)
                    .and_then(|()| PageRef::parse(&buf[..self.page_size])?.leaf_items());
                self.heap.recycle_buffer(buf);
                self.cur = Some(OpenLeaf {
                    path,
                    items: res?,
                    upper,
                    orig_block: child,
                    dirty: false,
                });
                return Ok(());
            }
        }
        unreachable!("descent always ends at a leaf");
    }

    fn make_slot(&mut self, bytes: &[u8], inline: usize) -> Result<SlotBuf> {
        if bytes.len() <= inline {
            return Ok(SlotBuf::inline(bytes.to_vec()));
        }
        let (size, first) = overflow::write(self.heap, bytes, inline, &mut self.allocated)?;
        Ok(SlotBuf {
            prefix: bytes[..inline].to_vec(),
            overflow: Some((size, first)),
        })
    }

    /// Rebuilds the affected path of the tree from the completed patches:
    /// leaves first, then each branch level, then the root.
    fn rebuild(&mut self) -> Result<()> {
        debug_assert!(self.cur.is_none(), "close the leaf before rebuilding");
        if self.done.is_empty() {
            self.drop_branch_cache();
            return Ok(());
        }
        let patches = std::mem::take(&mut self.done);

        if self.height == 0 {
            // The root is the single patched leaf.
            debug_assert_eq!(patches.len(), 1);
            let items = patches.into_iter().next().expect("one patch").items;
            self.emit_root(LevelItems::Leaf(items))?;
            self.drop_branch_cache();
            return Ok(());
        }

        // Leaf emission.
        let mut repls: Vec<Repl> = Vec::new();
        let mut writes: Vec<(u32, Vec<u8>)> = Vec::new();
        for patch in patches {
            let emitted = self.emit_pages(LevelItems::Leaf(patch.items), &mut writes)?;
            repls.push(Repl {
                path: patch.path,
                items: emitted,
            });
        }
        self.flush_writes(std::mem::take(&mut writes))?;

        // Branch levels, deepest first; the root level is handled last.
        let mut depth = self.height as usize - 1;
        while depth >= 1 {
            let mut next: Vec<Repl> = Vec::new();
            let mut writes: Vec<(u32, Vec<u8>)> = Vec::new();
            let mut i = 0;
            while i < repls.len() {
                let parent = repls[i].path[depth].block_id;
                let mut j = i;
                while j < repls.len() && repls[j].path[depth].block_id == parent {
                    j += 1;
                }
                let merged = self.merge_into_parent(parent, &mut repls[i..j], depth)?;
                self.heap.recycle(parent)?;
                if let Some(buf) = self.branches.remove(&parent) {
                    self.heap.recycle_buffer(buf);
                }
                let emitted = self.emit_pages(LevelItems::Branch(merged), &mut writes)?;
                let prefix = repls[i].path[..depth].to_vec();
                next.push(Repl {
                    path: prefix,
                    items: emitted,
                });
                i = j;
            }
            self.flush_writes(writes)?;
            repls = next;
            depth -= 1;
        }

        // Merge into the in-memory root page.
        let merged = self.merge_into_root(&mut repls)?;
        self.emit_root(LevelItems::Branch(merged))?;
        self.drop_branch_cache();
        Ok(())
    }

    /// Splices each replacement run into its parent's item list, freeing
    /// the separator chains of the entries being replaced.
    fn merge_into_parent(
        &mut self,
        parent: u32,
        group: &mut [Repl],
        depth: usize,
    ) -> Result<Vec<BranchItemBuf>> {
        let originals = {
            let bytes: &[u8] = match self.branches.get(&parent) {
                Some(buf) => &buf[..self.page_size],
                None => {
                    return Err(Error::OutOfRange {
                        what: "parent branch not loaded",
                    });
                }
            };
            PageRef::parse(bytes)?.branch_items()?
        };
        self.splice(originals, group, depth)
    }

    fn merge_into_root(&mut self, group: &mut [Repl]) -> Result<Vec<BranchItemBuf>> {
        let originals = PageRef::parse(&self.root_page)?.branch_items()?;
        self.splice(originals, group, 0)
    }

    fn splice(
        &mut self,
        originals: Vec<BranchItemBuf>,
        group: &mut [Repl],
        depth: usize,
    ) -> Result<Vec<BranchItemBuf>> {
        let mut out = Vec::with_capacity(originals.len() + group.len());
        let mut g = 0usize;
        for (i, orig) in originals.into_iter().enumerate() {
            if g < group.len() && group[g].path[depth].index == i {
                if let Some((_, first)) = orig.key.overflow {
                    overflow::recycle(self.heap, first)?;
                }
                out.append(&mut group[g].items);
                g += 1;
            } else {
                out.push(orig);
            }
        }
        debug_assert_eq!(g, group.len(), "every replacement must land");
        Ok(out)
    }

    /// Emits one item run as page-sized chunks: splits greedily, then
    /// rebalances the final pair so both halves are at least half full.
    /// Returns one branch item per emitted page.
    fn emit_pages(
        &mut self,
        items: LevelItems,
        writes: &mut Vec<(u32, Vec<u8>)>,
    ) -> Result<Vec<BranchItemBuf>> {
        let sizes: Vec<usize> = match &items {
            LevelItems::Leaf(v) => v.iter().map(page::leaf_item_len).collect(),
            LevelItems::Branch(v) => v.iter().map(page::branch_item_len).collect(),
        };
        if sizes.is_empty() {
            return Ok(Vec::new());
        }
        let bounds = partition(&sizes, self.page_size);

        let mut out = Vec::with_capacity(bounds.len());
        let mut start = 0usize;
        for &end in &bounds {
            let (id, _) = self.heap.allocate()?;
            self.allocated.push(id);
            let mut buf = self.heap.allocate_buffer();
            let separator = {
                let target = &mut buf[..self.page_size];
                match &items {
                    LevelItems::Leaf(v) => page::encode_leaf(target, &v[start..end])?
                        .expect("non-empty page")
                        .clone(),
                    LevelItems::Branch(v) => page::encode_branch(target, &v[start..end])?
                        .expect("non-empty page")
                        .clone(),
                }
            };
            let separator = self.dup_separator(&separator)?;
            writes.push((id, buf));
            out.push(BranchItemBuf {
                child: id,
                key: separator,
            });
            start = end;
        }
        Ok(out)
    }

    /// A separator promoted into a branch owns its bytes: an overflowed
    /// key is re-chained so leaf and branch never share a chain.
    fn dup_separator(&mut self, key: &SlotBuf) -> Result<SlotBuf> {
        match key.overflow {
            None => Ok(key.clone()),
            Some((size, first)) => {
                let mut full = Vec::with_capacity(key.total_len());
                overflow::read_into(self.heap, &key.prefix, size, first, &mut full)?;
                let (nsize, nfirst) =
                    overflow::write(self.heap, &full, self.key_inline, &mut self.allocated)?;
                Ok(SlotBuf {
                    prefix: full[..self.key_inline].to_vec(),
                    overflow: Some((nsize, nfirst)),
                })
            }
        }
    }

    /// Installs the new root: inline when the items fit one page,
    /// otherwise the run is emitted and the tree grows a level.
    fn emit_root(&mut self, items: LevelItems) -> Result<()> {
        let mut items = items;
        loop {
            let (count, body): (usize, usize) = match &items {
                LevelItems::Leaf(v) => (v.len(), v.iter().map(page::leaf_item_len).sum()),
                LevelItems::Branch(v) => (v.len(), v.iter().map(page::branch_item_len).sum()),
            };
            if count == 0 {
                let mut empty = vec![0u8; self.page_size];
                page::encode_empty_leaf(&mut empty);
                self.root_page = empty;
                self.height = 0;
                return Ok(());
            }
            if page::HEAD_SIZE + 2 * count + body <= self.page_size {
                let mut root = vec![0u8; self.page_size];
                match &items {
                    LevelItems::Leaf(v) => {
                        page::encode_leaf(&mut root, v)?;
                    }
                    LevelItems::Branch(v) => {
                        page::encode_branch(&mut root, v)?;
                    }
                }
                self.root_page = root;
                return Ok(());
            }
            let mut writes = Vec::new();
            let lifted = self.emit_pages(items, &mut writes)?;
            self.flush_writes(writes)?;
            items = LevelItems::Branch(lifted);
            self.height += 1;
        }
    }

    fn flush_writes(&self, writes: Vec<(u32, Vec<u8>)>) -> Result<()> {
        task::fork_join(writes, |(id, mut buf)| {
            self.heap.write_block(id, &mut buf)?;
            self.heap.recycle_buffer(buf);
            Ok(())
        })
    }

    fn drop_branch_cache(&mut self) {
        for (_, buf) in self.branches.drain() {
            self.heap.recycle_buffer(buf);
        }
    }

    /// Returns every block this batch allocated to the free structure.
    fn unwind(&mut self) {
        for id in self.allocated.drain(..) {
            let _ = self.heap.recycle(id);
        }
    }
}

fn find<H: Heap + ?Sized>(
    heap: &H,
    items: &[LeafItemBuf],
    key: &[u8],
) -> Result<(bool, usize)> {
    let mut lo = 0usize;
    let mut hi = items.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let slot = &items[mid].key;
        match overflow::compare_slot(heap, key, &slot.prefix, slot.overflow)? {
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => return Ok((true, mid)),
            Ordering::Less => hi = mid,
        }
    }
    Ok((false, lo))
}

/// Splits an item run into page-sized parts, returning the end index of
/// each part. The final pair is rebalanced so neither page falls under
/// half occupancy while its neighbour can spare items.
fn partition(sizes: &[usize], page_size: usize) -> Vec<usize> {
    let budget = page_size - page::HEAD_SIZE;
    let mut bounds = Vec::new();
    let mut acc = 0usize;
    for (i, &s) in sizes.iter().enumerate() {
        let cost = s + 2;
        if acc > 0 && acc + cost > budget {
            bounds.push(i);
            acc = 0;
        }
        acc += cost;
    }
    bounds.push(sizes.len());

    if bounds.len() >= 2 {
        let half = budget / 2;
        let mut split = bounds[bounds.len() - 2];
        let prev_start = if bounds.len() >= 3 {
            bounds[bounds.len() - 3]
        } else {
            0
        };
        let weight = |range: std::ops::Range<usize>| -> usize {
            sizes[range].iter().map(|s| s + 2).sum()
        };
        while weight(split..sizes.len()) < half
            && split > prev_start + 1
            && weight(prev_start..split - 1) >= half
            && weight(split - 1..sizes.len()) <= budget
        {
            split -= 1;
        }
        let n = bounds.len();
        bounds[n - 2] = split;
    }
    bounds
}
