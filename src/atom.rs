//! Summary: Atomic holder for the live (checkpoint, value) pair.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Readers acquire a consistent snapshot of the pair; writers replace it
//! under an outer mutex so only one mutation runs at a time. Readers are
//! blocked only for the brief exclusive section of the final swap, never
//! for the duration of a write.

use std::sync::{Mutex, RwLock};

use crate::checkpoint::Checkpoint;

struct Slot<T> {
    checkpoint: Checkpoint,
    value: T,
}

/// Lock-disciplined container for the live `(checkpoint, value)` pair.
pub struct Atom<T> {
    writer: Mutex<()>,
    slot: RwLock<Slot<T>>,
}

impl<T: Clone> Atom<T> {
    pub fn new(checkpoint: Checkpoint, value: T) -> Atom<T> {
        Atom {
            writer: Mutex::new(()),
            slot: RwLock::new(Slot { checkpoint, value }),
        }
    }

    /// Copies the pair, acquiring the checkpoint. Never torn: a reader
    /// sees either the pair before a swap or the pair after it.
    pub fn acquire(&self) -> (Checkpoint, T) {
        let guard = self.slot.read().unwrap();
        (guard.checkpoint.acquire(), guard.value.clone())
    }

    /// Runs `f` on the current pair under the writer mutex, then installs
    /// the pair it returns and releases the old checkpoint.
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error without touching the slot.
    pub fn swap<E>(
        &self,
        f: impl FnOnce(&Checkpoint, &T) -> Result<(Checkpoint, T), E>,
    ) -> Result<(), E> {
        let _writer = self.writer.lock().unwrap();
        let (checkpoint, value) = {
            let guard = self.slot.read().unwrap();
            (guard.checkpoint.acquire(), guard.value.clone())
        };
        let (new_checkpoint, new_value) = f(&checkpoint, &value)?;
        let mut guard = self.slot.write().unwrap();
        *guard = Slot {
            checkpoint: new_checkpoint,
            value: new_value,
        };
        // The displaced slot drops here, releasing the old checkpoint.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Node;

    #[test]
    fn test_acquire_bumps_refcount() {
        let node = Node::new();
        let atom = Atom::new(Checkpoint::adopt(node.clone()), 7u32);
        assert_eq!(node.refs(), 1);

        let (ckp, v) = atom.acquire();
        assert_eq!(v, 7);
        assert_eq!(node.refs(), 2);
        drop(ckp);
        assert_eq!(node.refs(), 1);
    }

    #[test]
    fn test_swap_releases_old_checkpoint() {
        let old_node = Node::new();
        let new_node = Node::new();
        let atom = Atom::new(Checkpoint::adopt(old_node.clone()), 1u32);

        atom.swap(|_, v| {
            assert_eq!(*v, 1);
            Ok::<_, ()>((Checkpoint::adopt(new_node.clone()), 2u32))
        })
        .expect("swap");

        assert_eq!(old_node.refs(), 0);
        assert_eq!(new_node.refs(), 1);
        let (_ckp, v) = atom.acquire();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_failed_swap_keeps_slot() {
        let node = Node::new();
        let atom = Atom::new(Checkpoint::adopt(node.clone()), 1u32);
        let res: Result<(), &str> = atom.swap(|_, _| Err("nope"));
        assert!(res.is_err());
        assert_eq!(node.refs(), 1);
        let (_ckp, v) = atom.acquire();
        assert_eq!(v, 1);
    }

    #[test]
    fn test_readers_see_before_or_after() {
        use std::sync::Arc;
        use std::thread;

        let atom = Arc::new(Atom::new(Checkpoint::adopt(Node::new()), (1u64, 1u64)));
        let writer = {
            let atom = atom.clone();
            thread::spawn(move || {
                for i in 2..200u64 {
                    atom.swap(|_, _| {
                        Ok::<_, ()>((Checkpoint::adopt(Node::new()), (i, i)))
                    })
                    .expect("swap");
                }
            })
        };
        let reader = {
            let atom = atom.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let (_ckp, (a, b)) = atom.acquire();
                    assert_eq!(a, b, "torn read");
                }
            })
        };
        writer.join().expect("writer");
        reader.join().expect("reader");
    }
}
