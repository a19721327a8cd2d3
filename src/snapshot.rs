//! Summary: Root snapshots: the immutable view a reader or writer starts from.
//! Copyright (c) YOAB. All rights reserved.

use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::page;

/// An immutable tree version: the root page, its height, the inline
/// sizes, and the checkpoint pin that keeps every referenced block alive.
///
/// The root page itself always lives in the meta entry, never in a
/// payload block; `height == 0` means the root is a leaf.
#[derive(Clone)]
pub struct Root {
    pub checkpoint: Checkpoint,
    pub page: Arc<Vec<u8>>,
    pub height: u32,
    pub key_inline: usize,
    pub val_inline: usize,
}

impl Root {
    /// An empty tree pinned to `checkpoint`.
    pub fn empty(checkpoint: Checkpoint, page_size: usize) -> Root {
        let (key_inline, val_inline) = page::inline_sizes(page_size, page::BRANCH_FACTOR);
        let mut buf = vec![0u8; page_size];
        page::encode_empty_leaf(&mut buf);
        Root {
            checkpoint,
            page: Arc::new(buf),
            height: 0,
            key_inline,
            val_inline,
        }
    }

    /// Rebuilds a root from the entry bytes a commit stored:
    /// `uvarint(height) ‖ compact page`.
    pub fn from_entry(
        checkpoint: Checkpoint,
        entry: &[u8],
        page_size: usize,
    ) -> crate::error::Result<Root> {
        if entry.is_empty() {
            return Ok(Root::empty(checkpoint, page_size));
        }
        let (height, n) = crate::varint::read_uvarint(entry).ok_or(crate::error::Error::OutOfRange {
            what: "entry height",
        })?;
        let buf = page::expand(&entry[n..], page_size)?;
        let (key_inline, val_inline) = page::inline_sizes(page_size, page::BRANCH_FACTOR);
        Ok(Root {
            checkpoint,
            page: Arc::new(buf),
            height: height as u32,
            key_inline,
            val_inline,
        })
    }

    /// Serializes a root page for the commit entry.
    pub fn to_entry(height: u32, root_page: &[u8]) -> crate::error::Result<Vec<u8>> {
        let compact = page::compact(root_page)?;
        let mut out = Vec::with_capacity(compact.len() + 2);
        crate::varint::write_uvarint(&mut out, u64::from(height));
        out.extend_from_slice(&compact);
        Ok(out)
    }
}
