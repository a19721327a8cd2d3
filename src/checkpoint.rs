//! Summary: Reference-counted checkpoint chain pinning blocks against reuse.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every commit creates a chain node; every block recycled while a node is
//! the live tail is charged to it. The allocator walks the chain from the
//! oldest node and only reissues blocks charged to nodes whose reference
//! count has dropped to zero, so a snapshot pins everything recycled at or
//! after the checkpoint it holds.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// One node of the checkpoint chain.
pub(crate) struct Node {
    /// The next (newer) node, set when the successor commit happens.
    next: Mutex<Option<Arc<Node>>>,
    /// Ring entries charged to this checkpoint.
    recycled: AtomicU32,
    /// Outstanding [`Checkpoint`] handles.
    refs: AtomicI32,
}

impl Node {
    pub(crate) fn new() -> Arc<Node> {
        Arc::new(Node {
            next: Mutex::new(None),
            recycled: AtomicU32::new(0),
            refs: AtomicI32::new(0),
        })
    }

    pub(crate) fn successor(&self) -> Option<Arc<Node>> {
        self.next.lock().unwrap().clone()
    }

    pub(crate) fn link(&self, next: Arc<Node>) {
        *self.next.lock().unwrap() = Some(next);
    }

    pub(crate) fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn recycled(&self) -> u32 {
        self.recycled.load(Ordering::Relaxed)
    }

    pub(crate) fn add_recycled(&self, n: u32) {
        self.recycled.fetch_add(n, Ordering::Relaxed);
    }

    /// Consumes one charged entry; the caller pops the matching ring slot.
    pub(crate) fn take_recycled(&self) -> bool {
        let cur = self.recycled.load(Ordering::Relaxed);
        if cur == 0 {
            return false;
        }
        self.recycled.store(cur - 1, Ordering::Relaxed);
        true
    }

    pub(crate) fn set_recycled(&self, n: u32) {
        self.recycled.store(n, Ordering::Relaxed);
    }

    /// Drops all pins, used by `close` to abandon outstanding readers.
    pub(crate) fn clear_refs(&self) {
        self.refs.store(0, Ordering::Release);
    }
}

/// A shared handle to one committed snapshot of the store.
///
/// Cloning acquires (bumps the reference count); dropping releases.
/// While any handle to a checkpoint is alive, no block recycled under it
/// or under any later checkpoint is reissued.
pub struct Checkpoint {
    node: Arc<Node>,
}

impl Checkpoint {
    /// Wraps `node` in a new handle, acquiring it.
    pub(crate) fn adopt(node: Arc<Node>) -> Checkpoint {
        node.refs.fetch_add(1, Ordering::AcqRel);
        Checkpoint { node }
    }

    /// Acquires another handle to the same checkpoint.
    pub fn acquire(&self) -> Checkpoint {
        Checkpoint::adopt(self.node.clone())
    }

    /// Current number of outstanding handles.
    pub fn ref_count(&self) -> i32 {
        self.node.refs()
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Clone for Checkpoint {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl Drop for Checkpoint {
    fn drop(&mut self) {
        self.node.refs.fetch_sub(1, Ordering::AcqRel);
    }
}
