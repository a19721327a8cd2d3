//! Summary: dictdb, an embedded, single-file, ordered key-value store.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The store is a layered stack:
//!
//! - a paged [`store::Store`] partitioning the file into fixed-size
//!   blocks, with copy-on-write checkpointing and a reference-counted
//!   snapshot chain that defers block reuse past every live reader;
//! - an [`overflow`] encoding chaining arbitrarily large keys and values
//!   through linked pages;
//! - a copy-on-write B+ tree ([`page`], [`writer`], [`cursor`]) that
//!   applies a sorted batch of mutations as a fresh tree version without
//!   mutating any page a live snapshot references.
//!
//! The [`Db`] façade wires the layers together behind `open`, `get`,
//! `set`, `batch`, transactions, and snapshot iterators.
//!
//! ```no_run
//! use dictdb::Db;
//!
//! let db = Db::open("example.kv")?;
//! db.set(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! # Ok::<(), dictdb::Error>(())
//! ```

pub mod atom;
pub mod checkpoint;
pub mod codec;
pub mod cursor;
mod db;
pub mod error;
pub mod file;
pub mod freelist;
pub mod memfile;
pub mod meta;
pub mod overflow;
pub mod page;
pub mod snapshot;
pub mod store;
pub mod task;
mod tx;
mod varint;
pub mod writer;

pub use atom::Atom;
pub use checkpoint::Checkpoint;
pub use codec::CodecSpec;
pub use cursor::Cursor;
pub use db::{Db, DbOptions, Iter, Snapshot};
pub use error::{Error, MetaFault, Result};
pub use file::{StorageFile, SysFile};
pub use memfile::MemFile;
pub use snapshot::Root;
pub use store::{Heap, Options, Store};
pub use tx::Tx;
