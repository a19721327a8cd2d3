//! Summary: Ordered cursor over one pinned root snapshot.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A cursor walks a tree version that its [`Root`] keeps pinned, so the
//! pages it reads are never reused underneath it. The level vector
//! records the path from the root down to the buffered leaf; `next` and
//! `prev` ascend it to the nearest unexhausted level and descend into the
//! sibling subtree.
//!
//! After a read error the cursor latches: `next`/`prev`/`key`/`val` keep
//! returning the same error until a `seek*` repositions it.

use std::cmp::Ordering;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::overflow;
use crate::page::PageRef;
use crate::snapshot::Root;
use crate::store::Heap;

enum PageSrc {
    /// The in-memory root page, shared with the snapshot.
    Root(std::sync::Arc<Vec<u8>>),
    /// A branch page faulted in from the heap.
    Block(Vec<u8>),
}

impl PageSrc {
    fn bytes(&self, page_size: usize) -> &[u8] {
        match self {
            PageSrc::Root(p) => &p[..page_size],
            PageSrc::Block(b) => &b[..page_size],
        }
    }
}

struct Level {
    block_id: u32,
    index: usize,
    count: usize,
    src: PageSrc,
}

enum CursorState {
    Invalid,
    Valid,
    Errored(Error),
}

/// Cursor over a pinned snapshot.
pub struct Cursor<'h, H: Heap + ?Sized> {
    heap: &'h H,
    root: Root,
    page_size: usize,
    /// One entry per branch level, root first.
    levels: Vec<Level>,
    leaf: Vec<u8>,
    leaf_id: u32,
    leaf_count: usize,
    index: usize,
    state: CursorState,
    scratch_key: Vec<u8>,
    scratch_val: Vec<u8>,
}

impl<'h, H: Heap + ?Sized> Cursor<'h, H> {
    pub fn new(heap: &'h H, root: Root) -> Cursor<'h, H> {
        let page_size = heap.page_size();
        let leaf = heap.allocate_buffer();
        let levels = (0..root.height as usize)
            .map(|depth| Level {
                block_id: 0,
                index: 0,
                count: 0,
                src: if depth == 0 {
                    PageSrc::Root(root.page.clone())
                } else {
                    PageSrc::Block(Vec::new())
                },
            })
            .collect();
        Cursor {
            heap,
            root,
            page_size,
            levels,
            leaf,
            leaf_id: 0,
            leaf_count: 0,
            index: 0,
            state: CursorState::Invalid,
            scratch_key: Vec::new(),
            scratch_val: Vec::new(),
        }
    }

    /// True when the cursor rests on an item.
    pub fn valid(&self) -> bool {
        matches!(self.state, CursorState::Valid)
    }

    /// Positions at the first item whose key is at least `k`.
    ///
    /// Returns true only on an exact match; the cursor may still be valid
    /// on a greater key (check [`Cursor::valid`]).
    pub fn seek(&mut self, k: &[u8]) -> Result<bool> {
        self.state = CursorState::Invalid;
        match self.seek_inner(k) {
            Ok(exact) => Ok(exact),
            Err(e) => {
                self.state = CursorState::Errored(e.clone());
                Err(e)
            }
        }
    }

    fn seek_inner(&mut self, k: &[u8]) -> Result<bool> {
        if self.root.height == 0 {
            self.load_root_leaf();
        } else {
            // Branch descent: first separator the key is not greater than,
            // else the rightmost child.
            {
                let parsed = PageRef::parse(self.levels[0].src.bytes(self.page_size))?;
                self.levels[0].count = parsed.count();
                self.levels[0].block_id = 0;
            }
            for depth in 0..self.root.height as usize {
                let (idx, child) = {
                    let lvl = &self.levels[depth];
                    let parsed = PageRef::parse(lvl.src.bytes(self.page_size))?;
                    let count = parsed.count();
                    if count == 0 {
                        return Err(Error::OutOfRange {
                            what: "empty branch page",
                        });
                    }
                    let mut lo = 0usize;
                    let mut hi = count;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let item = parsed.branch_item(mid)?;
                        let ord = overflow::compare_slot(
                            self.heap,
                            k,
                            item.key.prefix,
                            item.key.overflow,
                        )?;
                        if ord == Ordering::Greater {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    let idx = lo.min(count - 1);
                    (idx, parsed.branch_item(idx)?.child)
                };
                self.levels[depth].index = idx;
                if depth + 1 < self.root.height as usize {
                    self.load_level(depth + 1, child)?;
                } else {
                    self.load_leaf(child)?;
                }
            }
        }

        // Lower bound within the leaf.
        let parsed = PageRef::parse(&self.leaf[..self.page_size])?;
        let count = parsed.count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let item = parsed.leaf_item(mid)?;
            let ord =
                overflow::compare_slot(self.heap, k, item.key.prefix, item.key.overflow)?;
            if ord == Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= count {
            self.state = CursorState::Invalid;
            return Ok(false);
        }
        self.index = lo;
        self.state = CursorState::Valid;
        let item = parsed.leaf_item(lo)?;
        Ok(
            overflow::compare_slot(self.heap, k, item.key.prefix, item.key.overflow)?
                == Ordering::Equal,
        )
    }

    /// Positions at the smallest key. Returns [`Cursor::valid`].
    pub fn seek_first(&mut self) -> Result<bool> {
        self.seek_extreme(false)
    }

    /// Positions at the largest key. Returns [`Cursor::valid`].
    pub fn seek_last(&mut self) -> Result<bool> {
        self.seek_extreme(true)
    }

    fn seek_extreme(&mut self, rightmost: bool) -> Result<bool> {
        self.state = CursorState::Invalid;
        let res = (|| -> Result<()> {
            if self.root.height == 0 {
                self.load_root_leaf();
                if self.leaf_count > 0 {
                    self.index = if rightmost { self.leaf_count - 1 } else { 0 };
                    self.state = CursorState::Valid;
                }
                return Ok(());
            }
            {
                let parsed = PageRef::parse(self.levels[0].src.bytes(self.page_size))?;
                let count = parsed.count();
                if count == 0 {
                    return Err(Error::OutOfRange {
                        what: "empty branch page",
                    });
                }
                self.levels[0].count = count;
                self.levels[0].index = if rightmost { count - 1 } else { 0 };
            }
            self.descend_from(0, rightmost)
        })();
        match res {
            Ok(()) => Ok(self.valid()),
            Err(e) => {
                self.state = CursorState::Errored(e.clone());
                Err(e)
            }
        }
    }

    /// Advances to the next item in key order.
    pub fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    /// Steps back to the previous item in key order.
    pub fn prev(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        match &self.state {
            CursorState::Errored(e) => return Err(e.clone()),
            CursorState::Invalid => return Ok(false),
            CursorState::Valid => {}
        }
        match self.step_inner(forward) {
            Ok(b) => Ok(b),
            Err(e) => {
                self.state = CursorState::Errored(e.clone());
                Err(e)
            }
        }
    }

    fn step_inner(&mut self, forward: bool) -> Result<bool> {
        if forward && self.index + 1 < self.leaf_count {
            self.index += 1;
            return Ok(true);
        }
        if !forward && self.index > 0 {
            self.index -= 1;
            return Ok(true);
        }

        // Ascend to the nearest level with a sibling in the move
        // direction, then descend to that subtree's nearest leaf.
        let mut depth = self.levels.len();
        loop {
            if depth == 0 {
                self.state = CursorState::Invalid;
                return Ok(false);
            }
            depth -= 1;
            let lvl = &mut self.levels[depth];
            if forward && lvl.index + 1 < lvl.count {
                lvl.index += 1;
                break;
            }
            if !forward && lvl.index > 0 {
                lvl.index -= 1;
                break;
            }
        }
        self.descend_from(depth, !forward)?;
        Ok(true)
    }

    /// Descends from `levels[depth]`'s current index down to a leaf,
    /// taking the rightmost or leftmost child at every level below.
    fn descend_from(&mut self, from: usize, rightmost: bool) -> Result<()> {
        let mut depth = from;
        loop {
            let child = {
                let lvl = &self.levels[depth];
                let parsed = PageRef::parse(lvl.src.bytes(self.page_size))?;
                parsed.branch_item(lvl.index)?.child
            };
            if depth + 1 < self.levels.len() {
                self.load_level(depth + 1, child)?;
                let lvl = &mut self.levels[depth + 1];
                if lvl.count == 0 {
                    return Err(Error::OutOfRange {
                        what: "empty branch page",
                    });
                }
                lvl.index = if rightmost { lvl.count - 1 } else { 0 };
                depth += 1;
            } else {
                self.load_leaf(child)?;
                if self.leaf_count == 0 {
                    self.state = CursorState::Invalid;
                    return Ok(());
                }
                self.index = if rightmost { self.leaf_count - 1 } else { 0 };
                self.state = CursorState::Valid;
                return Ok(());
            }
        }
    }

    fn load_level(&mut self, depth: usize, block_id: u32) -> Result<()> {
        let mut buf = match std::mem::replace(
            &mut self.levels[depth].src,
            PageSrc::Block(Vec::new()),
        ) {
            PageSrc::Block(b) if !b.is_empty() => b,
            _ => self.heap.allocate_buffer(),
        };
        self.heap.read_block(block_id, &mut buf)?;
        let count = PageRef::parse(&buf[..self.page_size])?.count();
        self.levels[depth] = Level {
            block_id,
            index: 0,
            count,
            src: PageSrc::Block(buf),
        };
        Ok(())
    }

    fn load_leaf(&mut self, block_id: u32) -> Result<()> {
        self.heap.read_block(block_id, &mut self.leaf)?;
        self.leaf_count = PageRef::parse(&self.leaf[..self.page_size])?.count();
        self.leaf_id = block_id;
        Ok(())
    }

    fn load_root_leaf(&mut self) {
        self.leaf[..self.page_size].copy_from_slice(&self.root.page[..self.page_size]);
        self.leaf_id = 0;
        self.leaf_count = PageRef::parse(&self.leaf[..self.page_size])
            .map(|p| p.count())
            .unwrap_or(0);
    }

    /// The key under the cursor. Inline keys borrow the leaf page;
    /// oversized keys are materialized into a scratch buffer valid until
    /// the next cursor operation.
    pub fn key(&mut self) -> Result<&[u8]> {
        let (range, ov) = self.slot_parts(true)?;
        match ov {
            None => Ok(&self.leaf[range]),
            Some((size, first)) => {
                self.scratch_key.clear();
                overflow::read_into(
                    self.heap,
                    &self.leaf[range],
                    size,
                    first,
                    &mut self.scratch_key,
                )?;
                Ok(&self.scratch_key)
            }
        }
    }

    /// The value under the cursor; same lifetime rules as [`Cursor::key`].
    pub fn val(&mut self) -> Result<&[u8]> {
        let (range, ov) = self.slot_parts(false)?;
        match ov {
            None => Ok(&self.leaf[range]),
            Some((size, first)) => {
                self.scratch_val.clear();
                overflow::read_into(
                    self.heap,
                    &self.leaf[range],
                    size,
                    first,
                    &mut self.scratch_val,
                )?;
                Ok(&self.scratch_val)
            }
        }
    }

    /// Copies the current key into `out`.
    pub fn key_copy(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        let k = self.key()?;
        out.extend_from_slice(k);
        Ok(())
    }

    /// Copies the current value into `out`.
    pub fn val_copy(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        let v = self.val()?;
        out.extend_from_slice(v);
        Ok(())
    }

    fn slot_parts(&self, key: bool) -> Result<(Range<usize>, Option<(u32, u32)>)> {
        match &self.state {
            CursorState::Errored(e) => return Err(e.clone()),
            CursorState::Invalid => {
                return Err(Error::OutOfRange {
                    what: "cursor not positioned",
                });
            }
            CursorState::Valid => {}
        }
        let page = &self.leaf[..self.page_size];
        let parsed = PageRef::parse(page)?;
        let item = parsed.leaf_item(self.index)?;
        let slot = if key { item.key } else { item.val };
        let base = self.leaf.as_ptr() as usize;
        let start = slot.prefix.as_ptr() as usize - base;
        Ok((start..start + slot.prefix.len(), slot.overflow))
    }
}

impl<'h, H: Heap + ?Sized> Drop for Cursor<'h, H> {
    fn drop(&mut self) {
        let leaf = std::mem::take(&mut self.leaf);
        self.heap.recycle_buffer(leaf);
        for lvl in self.levels.drain(..) {
            if let PageSrc::Block(buf) = lvl.src {
                self.heap.recycle_buffer(buf);
            }
        }
    }
}
