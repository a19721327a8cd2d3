//! Summary: Public key-value façade over the layered storage stack.
//! Copyright (c) YOAB. All rights reserved.
//!
//! `Db` is a thin adapter: reads acquire the live root snapshot from the
//! atom and walk it with a cursor; writes funnel through the batch
//! writer, commit the new root page as the block store's entry, and swap
//! the atom. Readers never block writers and see either the previous
//! snapshot or the new one, never a torn composite.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::atom::Atom;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::file::{StorageFile, SysFile};
use crate::page;
use crate::snapshot::Root;
use crate::store::{Heap, Options, Store};
use crate::tx::Tx;
use crate::writer;

/// Database configuration.
#[derive(Debug, Clone, Default)]
pub struct DbOptions {
    pub store: Options,
    /// Page budget for one write batch; 0 means the default.
    pub max_loaded_pages: usize,
}

/// The root value the atom guards next to its checkpoint.
#[derive(Clone)]
struct RootData {
    page: Arc<Vec<u8>>,
    height: u32,
}

/// An embedded, single-file, ordered key-value store.
///
/// # Concurrency
///
/// Any number of readers may run concurrently with one writer; writers
/// serialize on the atom's writer mutex.
pub struct Db<F: StorageFile> {
    store: Arc<Store<F>>,
    atom: Atom<RootData>,
    max_loaded: usize,
}

impl Db<SysFile> {
    /// Opens (creating if missing) a database file at `path` with default
    /// options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db<SysFile>> {
        let file =
            SysFile::open(path).map_err(|e| Error::io("opening database file", e))?;
        Db::open_with(file, DbOptions::default())
    }
}

impl<F: StorageFile> Db<F> {
    /// Opens a database over any [`StorageFile`].
    pub fn open_with(file: F, options: DbOptions) -> Result<Db<F>> {
        let max_loaded = if options.max_loaded_pages == 0 {
            writer::DEFAULT_MAX_LOADED_PAGES
        } else {
            options.max_loaded_pages
        };
        let (store, entry, checkpoint) = Store::load(file, options.store)?;
        let store = Arc::new(store);
        let root = Root::from_entry(checkpoint, &entry, store.page_size())?;
        let data = RootData {
            page: root.page.clone(),
            height: root.height,
        };
        Ok(Db {
            store,
            atom: Atom::new(root.checkpoint, data),
            max_loaded,
        })
    }

    /// Pins the live tree version for reading.
    pub fn snapshot(&self) -> Snapshot<F> {
        let (checkpoint, data) = self.atom.acquire();
        Snapshot {
            store: self.store.clone(),
            root: self.make_root(checkpoint, &data),
        }
    }

    fn make_root(&self, checkpoint: crate::checkpoint::Checkpoint, data: &RootData) -> Root {
        let (key_inline, val_inline) =
            page::inline_sizes(self.store.page_size(), page::BRANCH_FACTOR);
        Root {
            checkpoint,
            page: data.page.clone(),
            height: data.height,
            key_inline,
            val_inline,
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.snapshot().get(key)
    }

    /// Inserts or updates one key.
    pub fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.batch([(key.to_vec(), Some(val.to_vec()))])
    }

    /// Deletes one key; absent keys are a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.batch([(key.to_vec(), None)])
    }

    /// Applies a group of mutations as one atomic checkpoint. `None`
    /// deletes; for duplicate keys the last entry wins.
    ///
    /// # Errors
    ///
    /// On failure the store rolls back to the previous checkpoint and the
    /// visible state is unchanged.
    pub fn batch<I>(&self, ops: I) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    {
        let sorted: BTreeMap<Vec<u8>, Option<Vec<u8>>> = ops.into_iter().collect();
        if sorted.is_empty() {
            return Ok(());
        }
        self.atom.swap(|checkpoint, data| {
            let root = self.make_root(checkpoint.acquire(), data);
            let res = writer::apply(self.store.as_ref(), &root, sorted, self.max_loaded)
                .and_then(|(page, height)| {
                    let entry = Root::to_entry(height, &page)?;
                    let (_, new_checkpoint) = self.store.commit(&entry)?;
                    Ok((
                        new_checkpoint,
                        RootData {
                            page: Arc::new(page),
                            height,
                        },
                    ))
                });
            match res {
                Ok(v) => Ok(v),
                Err(e) => {
                    let _ = self.store.rollback();
                    Err(e)
                }
            }
        })
    }

    /// Begins a read-committed transaction.
    pub fn begin(&self) -> Tx<'_, F> {
        Tx::new(self)
    }

    /// Closes the underlying store. Outstanding snapshots keep their
    /// buffers but every further operation fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// A pinned, immutable view of one committed tree version.
pub struct Snapshot<F: StorageFile> {
    store: Arc<Store<F>>,
    root: Root,
}

impl<F: StorageFile> Snapshot<F> {
    /// Returns the value stored under `key` in this snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor();
        if cursor.seek(key)? {
            Ok(Some(cursor.val()?.to_vec()))
        } else {
            Ok(None)
        }
    }

    /// A cursor over this snapshot.
    pub fn cursor(&self) -> Cursor<'_, Store<F>> {
        Cursor::new(self.store.as_ref(), self.root.clone())
    }

    /// Iterates every pair in ascending key order.
    pub fn iter(&self) -> Iter<'_, F> {
        Iter {
            cursor: self.cursor(),
            started: false,
            done: false,
        }
    }
}

/// Iterator over a snapshot's pairs.
pub struct Iter<'s, F: StorageFile> {
    cursor: Cursor<'s, Store<F>>,
    started: bool,
    done: bool,
}

impl<'s, F: StorageFile> Iterator for Iter<'s, F> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let advanced = if self.started {
            self.cursor.next()
        } else {
            self.started = true;
            self.cursor.seek_first()
        };
        match advanced {
            Ok(true) => {
                let pair = self
                    .cursor
                    .key()
                    .map(<[u8]>::to_vec)
                    .and_then(|k| Ok((k, self.cursor.val()?.to_vec())));
                Some(pair)
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
