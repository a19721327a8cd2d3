//! Summary: In-memory storage file for tests and ephemeral stores.
//! Copyright (c) YOAB. All rights reserved.

use std::io;
use std::sync::{Arc, Mutex};

use crate::file::StorageFile;

struct Inner {
    data: Vec<u8>,
    /// Writes that would grow the file past this limit fail with
    /// `StorageFull`, which lets tests exhaust the disk mid-batch.
    capacity: Option<u64>,
}

/// A [`StorageFile`] held entirely in memory.
///
/// Cloning shares the same backing buffer, so a store and a test can hold
/// handles to the same "file".
#[derive(Clone)]
pub struct MemFile {
    inner: Arc<Mutex<Inner>>,
}

impl MemFile {
    /// Creates a new, empty in-memory file.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: Vec::new(),
                capacity: None,
            })),
        }
    }

    /// Caps the file at `limit` bytes; growth past it fails like a full
    /// disk. `None` removes the cap.
    pub fn set_capacity(&self, limit: Option<u64>) {
        self.inner.lock().unwrap().capacity = limit;
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }

    /// Overwrites the contents, ignoring the capacity cap. Used by tests
    /// that hand-craft file images.
    pub fn set_contents(&self, data: Vec<u8>) {
        self.inner.lock().unwrap().data = data;
    }
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "offset overflow")
        })?;
        if end > inner.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            ));
        }
        buf.copy_from_slice(&inner.data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "offset overflow")
        })?;
        if let Some(cap) = inner.capacity {
            if end as u64 > cap {
                return Err(io::Error::new(
                    io::ErrorKind::StorageFull,
                    "memory file capacity exceeded",
                ));
            }
        }
        if end > inner.data.len() {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cap) = inner.capacity {
            if len > cap {
                return Err(io::Error::new(
                    io::ErrorKind::StorageFull,
                    "memory file capacity exceeded",
                ));
            }
        }
        inner.data.resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.inner.lock().unwrap().data.len() as u64)
    }
}
