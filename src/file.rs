//! Summary: Storage file capability and the standard filesystem backend.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The block store consumes any random-access, truncate-capable, syncable
//! byte container through the [`StorageFile`] trait. Production databases
//! use [`SysFile`]; tests and ephemeral stores use `MemFile`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Random-access byte container backing a block store.
///
/// All methods take `&self`: positional reads and writes may run
/// concurrently from multiple threads, the way `pread`/`pwrite` do.
pub trait StorageFile: Send + Sync + 'static {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes all of `buf` starting at `offset`, extending the file if
    /// needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Resizes the file to exactly `len` bytes.
    fn truncate(&self, len: u64) -> io::Result<()>;

    /// Flushes written data to durable storage.
    fn sync(&self) -> io::Result<()>;

    /// Returns the current file length in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// A [`StorageFile`] over a regular filesystem file.
pub struct SysFile {
    file: File,
}

impl SysFile {
    /// Opens (creating if missing) a read-write file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens an existing file at `path` for reading only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }
}

impl From<File> for SysFile {
    fn from(file: File) -> Self {
        Self { file }
    }
}

impl StorageFile for SysFile {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut pos = 0usize;
        while pos < buf.len() {
            let n = self.file.seek_read(&mut buf[pos..], offset + pos as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of file",
                ));
            }
            pos += n;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut pos = 0usize;
        while pos < buf.len() {
            let n = self.file.seek_write(&buf[pos..], offset + pos as u64)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            pos += n;
        }
        Ok(())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// Uses `fdatasync` on Unix, skipping the metadata flush `fsync` pays
    /// for; falls back to `sync_all` elsewhere.
    fn sync(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
            let ret = unsafe { libc::fdatasync(self.file.as_raw_fd()) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.file.sync_all()
        }
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
