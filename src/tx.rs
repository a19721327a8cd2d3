//! Summary: Read-committed transactions over the key-value façade.
//! Copyright (c) YOAB. All rights reserved.

use std::collections::BTreeMap;

use crate::db::Db;
use crate::error::Result;
use crate::file::StorageFile;

/// A read-committed transaction.
///
/// Writes buffer in memory and reach the store as one atomic batch on
/// [`Tx::commit`]. Reads see the transaction's own pending writes first,
/// then the latest committed state. Dropping the transaction without
/// committing discards every pending change.
pub struct Tx<'db, F: StorageFile> {
    db: &'db Db<F>,
    /// Pending mutations; `None` marks a delete.
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'db, F: StorageFile> Tx<'db, F> {
    pub(crate) fn new(db: &'db Db<F>) -> Tx<'db, F> {
        Tx {
            db,
            pending: BTreeMap::new(),
        }
    }

    /// Stages an insert or update.
    pub fn set(&mut self, key: &[u8], val: &[u8]) {
        self.pending.insert(key.to_vec(), Some(val.to_vec()));
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    /// Reads through the pending overlay, then the committed state.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        self.db.get(key)
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every staged mutation as one atomic batch.
    pub fn commit(self) -> Result<()> {
        self.db.batch(self.pending)
    }

    /// Discards every staged mutation. Dropping does the same; this just
    /// says it out loud.
    pub fn rollback(self) {}
}
