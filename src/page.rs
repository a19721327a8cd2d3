//! Summary: B+ tree page layout: header, offset table, leaf and branch items.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A page starts with a 4-byte header: `tag = (count & 0x3FFF) | branch
//! bit` and `length`, the total item-body bytes, both little-endian. The
//! offset table follows, one u16 per item holding the item's end offset
//! relative to byte 4. Items are packed back to front, so they sit
//! contiguously at the page end with the free gap in the middle.
//!
//! A leaf item is `uvarint(desc) ‖ key slot ‖ value slot`, where `desc`
//! folds the inline key length and both overflow bits. A branch item is
//! `child id ‖ uvarint(desc) ‖ key slot`. An overflowed slot ends with the
//! chain's `size ‖ first block id`.

use crate::error::{Error, Result};
use crate::varint::{read_uvarint, uvarint_len, write_uvarint};

/// Page header bytes.
pub const HEAD_SIZE: usize = 4;
/// Tag bit set on branch pages.
pub const BRANCH_TAG: u16 = 0x4000;
/// Mask extracting the item count from the tag.
pub const COUNT_MASK: u16 = 0x3FFF;
/// Trailing bytes of an overflowed slot: u32 size plus u32 first id.
pub const OVERFLOW_REF: usize = 8;
/// Keys a branch page is sized to hold at worst case.
pub const BRANCH_FACTOR: usize = 16;

/// Worst-case bytes besides the key needed per branch item: offset entry,
/// child id, descriptor varint, overflow reference.
const BRANCH_ITEM_OVERHEAD: usize = 2 + 4 + 5 + OVERFLOW_REF;
/// Same for a leaf item with an overflowed value.
const LEAF_ITEM_OVERHEAD: usize = 2 + 5 + OVERFLOW_REF + OVERFLOW_REF;

/// An owned key or value slot: the inline bytes plus the overflow chain
/// reference when the full content is longer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotBuf {
    pub prefix: Vec<u8>,
    pub overflow: Option<(u32, u32)>,
}

impl SlotBuf {
    pub fn inline(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: bytes.into(),
            overflow: None,
        }
    }

    /// Full byte length of the represented content.
    pub fn total_len(&self) -> usize {
        self.prefix.len() + self.overflow.map_or(0, |(size, _)| size as usize)
    }

    fn encoded_len(&self) -> usize {
        self.prefix.len() + if self.overflow.is_some() { OVERFLOW_REF } else { 0 }
    }
}

/// A borrowed slot inside a parsed page.
#[derive(Debug, Clone, Copy)]
pub struct SlotRef<'a> {
    pub prefix: &'a [u8],
    pub overflow: Option<(u32, u32)>,
}

impl<'a> SlotRef<'a> {
    pub fn to_buf(self) -> SlotBuf {
        SlotBuf {
            prefix: self.prefix.to_vec(),
            overflow: self.overflow,
        }
    }

    pub fn total_len(&self) -> usize {
        self.prefix.len() + self.overflow.map_or(0, |(size, _)| size as usize)
    }

    pub fn is_inline(&self) -> bool {
        self.overflow.is_none()
    }
}

/// One owned leaf item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafItemBuf {
    pub key: SlotBuf,
    pub val: SlotBuf,
}

/// One owned branch item: the child block and its separator key (the
/// largest key in the child's subtree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchItemBuf {
    pub child: u32,
    pub key: SlotBuf,
}

/// Borrowed leaf item.
pub struct LeafItemRef<'a> {
    pub key: SlotRef<'a>,
    pub val: SlotRef<'a>,
}

/// Borrowed branch item.
pub struct BranchItemRef<'a> {
    pub child: u32,
    pub key: SlotRef<'a>,
}

/// Encoded size of a leaf item.
pub fn leaf_item_len(item: &LeafItemBuf) -> usize {
    let desc = leaf_desc(item);
    uvarint_len(desc) + item.key.encoded_len() + item.val.encoded_len()
}

/// Encoded size of a branch item.
pub fn branch_item_len(item: &BranchItemBuf) -> usize {
    let desc = branch_desc(item);
    4 + uvarint_len(desc) + item.key.encoded_len()
}

fn leaf_desc(item: &LeafItemBuf) -> u64 {
    ((item.key.prefix.len() as u64) << 2)
        | u64::from(item.key.overflow.is_some()) << 1
        | u64::from(item.val.overflow.is_some())
}

fn branch_desc(item: &BranchItemBuf) -> u64 {
    ((item.key.prefix.len() as u64) << 1) | u64::from(item.key.overflow.is_some())
}

fn page_error() -> Error {
    Error::OutOfRange {
        what: "page item bounds",
    }
}

/// A parsed, bounds-checked view over one page.
pub struct PageRef<'a> {
    buf: &'a [u8],
    count: usize,
    is_leaf: bool,
    length: usize,
}

impl<'a> PageRef<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<PageRef<'a>> {
        if buf.len() < HEAD_SIZE {
            return Err(page_error());
        }
        let tag = u16::from_le_bytes([buf[0], buf[1]]);
        let count = (tag & COUNT_MASK) as usize;
        let is_leaf = tag & BRANCH_TAG == 0;
        let length = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if HEAD_SIZE + 2 * count + length > buf.len() {
            return Err(page_error());
        }
        if count > 0 {
            let last_end = read_offset(buf, count - 1)?;
            if HEAD_SIZE + last_end != buf.len() {
                return Err(page_error());
            }
        } else if length != 0 {
            return Err(page_error());
        }
        Ok(PageRef {
            buf,
            count,
            is_leaf,
            length,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    fn item_bytes(&self, index: usize) -> Result<&'a [u8]> {
        if index >= self.count {
            return Err(page_error());
        }
        let start = if index == 0 {
            self.buf.len() - self.length
        } else {
            HEAD_SIZE + read_offset(self.buf, index - 1)?
        };
        let end = HEAD_SIZE + read_offset(self.buf, index)?;
        if start > end || end > self.buf.len() || start < HEAD_SIZE + 2 * self.count {
            return Err(page_error());
        }
        Ok(&self.buf[start..end])
    }

    pub fn leaf_item(&self, index: usize) -> Result<LeafItemRef<'a>> {
        debug_assert!(self.is_leaf);
        let bytes = self.item_bytes(index)?;
        let (desc, n) = read_uvarint(bytes).ok_or_else(page_error)?;
        let key_ov = desc & 0b10 != 0;
        let val_ov = desc & 0b01 != 0;
        let key_len = (desc >> 2) as usize;
        let rest = &bytes[n..];

        let key_total = key_len + if key_ov { OVERFLOW_REF } else { 0 };
        if rest.len() < key_total {
            return Err(page_error());
        }
        let key = parse_slot(&rest[..key_total], key_ov)?;
        let val = parse_slot(&rest[key_total..], val_ov)?;
        Ok(LeafItemRef { key, val })
    }

    pub fn branch_item(&self, index: usize) -> Result<BranchItemRef<'a>> {
        debug_assert!(!self.is_leaf);
        let bytes = self.item_bytes(index)?;
        if bytes.len() < 4 {
            return Err(page_error());
        }
        let child = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let (desc, n) = read_uvarint(&bytes[4..]).ok_or_else(page_error)?;
        let key_ov = desc & 1 != 0;
        let key_len = (desc >> 1) as usize;
        let rest = &bytes[4 + n..];
        if rest.len() != key_len + if key_ov { OVERFLOW_REF } else { 0 } {
            return Err(page_error());
        }
        let key = parse_slot(rest, key_ov)?;
        Ok(BranchItemRef { child, key })
    }

    /// Owned copies of every branch item, used when a branch is rewritten.
    pub fn branch_items(&self) -> Result<Vec<BranchItemBuf>> {
        (0..self.count)
            .map(|i| {
                let item = self.branch_item(i)?;
                Ok(BranchItemBuf {
                    child: item.child,
                    key: item.key.to_buf(),
                })
            })
            .collect()
    }

    /// Owned copies of every leaf item, used when a leaf is patched.
    pub fn leaf_items(&self) -> Result<Vec<LeafItemBuf>> {
        (0..self.count)
            .map(|i| {
                let item = self.leaf_item(i)?;
                Ok(LeafItemBuf {
                    key: item.key.to_buf(),
                    val: item.val.to_buf(),
                })
            })
            .collect()
    }
}

fn read_offset(buf: &[u8], index: usize) -> Result<usize> {
    let at = HEAD_SIZE + 2 * index;
    if at + 2 > buf.len() {
        return Err(page_error());
    }
    Ok(u16::from_le_bytes([buf[at], buf[at + 1]]) as usize)
}

fn parse_slot(bytes: &[u8], overflowed: bool) -> Result<SlotRef<'_>> {
    if !overflowed {
        return Ok(SlotRef {
            prefix: bytes,
            overflow: None,
        });
    }
    if bytes.len() < OVERFLOW_REF {
        return Err(page_error());
    }
    let split = bytes.len() - OVERFLOW_REF;
    let size = u32::from_le_bytes([
        bytes[split],
        bytes[split + 1],
        bytes[split + 2],
        bytes[split + 3],
    ]);
    let first = u32::from_le_bytes([
        bytes[split + 4],
        bytes[split + 5],
        bytes[split + 6],
        bytes[split + 7],
    ]);
    Ok(SlotRef {
        prefix: &bytes[..split],
        overflow: Some((size, first)),
    })
}

fn write_slot(out: &mut Vec<u8>, slot: &SlotBuf) {
    out.extend_from_slice(&slot.prefix);
    if let Some((size, first)) = slot.overflow {
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&first.to_le_bytes());
    }
}

/// Encodes a leaf page into a zeroed page buffer, packing items back to
/// front. Returns the separator key, the last one written.
pub fn encode_leaf<'i>(
    page: &mut [u8],
    items: &'i [LeafItemBuf],
) -> Result<Option<&'i SlotBuf>> {
    let sizes: Vec<usize> = items.iter().map(leaf_item_len).collect();
    encode_page(page, true, &sizes, |i, out| {
        let item = &items[i];
        write_uvarint(out, leaf_desc(item));
        write_slot(out, &item.key);
        write_slot(out, &item.val);
    })?;
    Ok(items.last().map(|i| &i.key))
}

/// Encodes a branch page; same contract as [`encode_leaf`].
pub fn encode_branch<'i>(
    page: &mut [u8],
    items: &'i [BranchItemBuf],
) -> Result<Option<&'i SlotBuf>> {
    let sizes: Vec<usize> = items.iter().map(branch_item_len).collect();
    encode_page(page, false, &sizes, |i, out| {
        let item = &items[i];
        out.extend_from_slice(&item.child.to_le_bytes());
        write_uvarint(out, branch_desc(item));
        write_slot(out, &item.key);
    })?;
    Ok(items.last().map(|i| &i.key))
}

fn encode_page(
    page: &mut [u8],
    is_leaf: bool,
    sizes: &[usize],
    mut write_item: impl FnMut(usize, &mut Vec<u8>),
) -> Result<()> {
    let count = sizes.len();
    if count > COUNT_MASK as usize {
        return Err(page_error());
    }
    let body: usize = sizes.iter().sum();
    if HEAD_SIZE + 2 * count + body > page.len() {
        return Err(page_error());
    }

    let mut scratch = Vec::with_capacity(64);
    let mut end = page.len();
    for i in (0..count).rev() {
        scratch.clear();
        write_item(i, &mut scratch);
        debug_assert_eq!(scratch.len(), sizes[i]);
        let start = end - scratch.len();
        page[start..end].copy_from_slice(&scratch);
        let off = (end - HEAD_SIZE) as u16;
        page[HEAD_SIZE + 2 * i..HEAD_SIZE + 2 * i + 2].copy_from_slice(&off.to_le_bytes());
        end = start;
    }

    let tag = (count as u16 & COUNT_MASK) | if is_leaf { 0 } else { BRANCH_TAG };
    page[..2].copy_from_slice(&tag.to_le_bytes());
    page[2..4].copy_from_slice(&(body as u16).to_le_bytes());
    Ok(())
}

/// Writes an empty leaf page.
pub fn encode_empty_leaf(page: &mut [u8]) {
    page.fill(0);
}

/// Inline sizes for keys and values given the page size.
///
/// The key inline size guarantees a branch page holds at least
/// `branch_factor` worst-case items; the value inline size guarantees a
/// leaf page holds at least two items with worst-case inline keys and
/// overflowed values.
pub fn inline_sizes(page_size: usize, branch_factor: usize) -> (usize, usize) {
    let usable = page_size - HEAD_SIZE;
    let key_inline = (usable / branch_factor).saturating_sub(BRANCH_ITEM_OVERHEAD);
    let val_inline = (usable / 2)
        .saturating_sub(LEAF_ITEM_OVERHEAD)
        .saturating_sub(key_inline);
    (key_inline.max(1), val_inline.max(1))
}

/// Strips the free gap out of a page for transport: header, offset table,
/// and the item body.
pub fn compact(page: &[u8]) -> Result<Vec<u8>> {
    let parsed = PageRef::parse(page)?;
    let mut out = Vec::with_capacity(HEAD_SIZE + 2 * parsed.count + parsed.length);
    out.extend_from_slice(&page[..HEAD_SIZE + 2 * parsed.count]);
    out.extend_from_slice(&page[page.len() - parsed.length..]);
    Ok(out)
}

/// Reconstitutes a page of `page_size` bytes from its compact form.
pub fn expand(compact: &[u8], page_size: usize) -> Result<Vec<u8>> {
    if compact.len() < HEAD_SIZE {
        return Err(page_error());
    }
    let tag = u16::from_le_bytes([compact[0], compact[1]]);
    let count = (tag & COUNT_MASK) as usize;
    let length = u16::from_le_bytes([compact[2], compact[3]]) as usize;
    if compact.len() != HEAD_SIZE + 2 * count + length || compact.len() > page_size {
        return Err(page_error());
    }
    let mut page = vec![0u8; page_size];
    page[..HEAD_SIZE + 2 * count].copy_from_slice(&compact[..HEAD_SIZE + 2 * count]);
    page[page_size - length..].copy_from_slice(&compact[HEAD_SIZE + 2 * count..]);
    PageRef::parse(&page)?;
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 508;

    fn leaf(key: &[u8], val: &[u8]) -> LeafItemBuf {
        LeafItemBuf {
            key: SlotBuf::inline(key),
            val: SlotBuf::inline(val),
        }
    }

    #[test]
    fn test_leaf_round_trip() {
        let items = vec![
            leaf(b"alpha", b"1"),
            leaf(b"beta", b"two"),
            leaf(b"gamma", b"3333"),
        ];
        let mut page = vec![0u8; PAGE];
        let sep = encode_leaf(&mut page, &items).expect("encode");
        assert_eq!(sep.expect("separator").prefix, b"gamma");

        let parsed = PageRef::parse(&page).expect("parse");
        assert!(parsed.is_leaf());
        assert_eq!(parsed.count(), 3);
        for (i, want) in items.iter().enumerate() {
            let got = parsed.leaf_item(i).expect("item");
            assert_eq!(got.key.prefix, want.key.prefix.as_slice());
            assert_eq!(got.val.prefix, want.val.prefix.as_slice());
            assert!(got.key.is_inline());
        }
    }

    #[test]
    fn test_leaf_overflow_slots() {
        let items = vec![LeafItemBuf {
            key: SlotBuf {
                prefix: b"pre".to_vec(),
                overflow: Some((1000, 7)),
            },
            val: SlotBuf {
                prefix: b"vvv".to_vec(),
                overflow: Some((2000, 9)),
            },
        }];
        let mut page = vec![0u8; PAGE];
        encode_leaf(&mut page, &items).expect("encode");

        let parsed = PageRef::parse(&page).expect("parse");
        let got = parsed.leaf_item(0).expect("item");
        assert_eq!(got.key.prefix, b"pre");
        assert_eq!(got.key.overflow, Some((1000, 7)));
        assert_eq!(got.key.total_len(), 1003);
        assert_eq!(got.val.prefix, b"vvv");
        assert_eq!(got.val.overflow, Some((2000, 9)));
    }

    #[test]
    fn test_branch_round_trip() {
        let items = vec![
            BranchItemBuf {
                child: 12,
                key: SlotBuf::inline(b"m".as_slice()),
            },
            BranchItemBuf {
                child: 13,
                key: SlotBuf {
                    prefix: b"zz".to_vec(),
                    overflow: Some((64, 20)),
                },
            },
        ];
        let mut page = vec![0u8; PAGE];
        encode_branch(&mut page, &items).expect("encode");

        let parsed = PageRef::parse(&page).expect("parse");
        assert!(!parsed.is_leaf());
        assert_eq!(parsed.count(), 2);
        let first = parsed.branch_item(0).expect("item");
        assert_eq!(first.child, 12);
        assert_eq!(first.key.prefix, b"m");
        let second = parsed.branch_item(1).expect("item");
        assert_eq!(second.child, 13);
        assert_eq!(second.key.overflow, Some((64, 20)));

        let owned = parsed.branch_items().expect("owned");
        assert_eq!(owned, items);
    }

    #[test]
    fn test_empty_page() {
        let mut page = vec![0u8; PAGE];
        encode_empty_leaf(&mut page);
        let parsed = PageRef::parse(&page).expect("parse");
        assert!(parsed.is_leaf());
        assert_eq!(parsed.count(), 0);
    }

    #[test]
    fn test_encode_rejects_overfull() {
        let items: Vec<LeafItemBuf> = (0..8)
            .map(|i| leaf(format!("key{i}").as_bytes(), &[0u8; 100]))
            .collect();
        let mut page = vec![0u8; 256];
        assert!(encode_leaf(&mut page, &items).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_offsets() {
        let items = vec![leaf(b"k", b"v")];
        let mut page = vec![0u8; PAGE];
        encode_leaf(&mut page, &items).expect("encode");
        // Point the last offset past the page end.
        let bogus = (PAGE as u16).to_le_bytes();
        page[HEAD_SIZE..HEAD_SIZE + 2].copy_from_slice(&bogus);
        assert!(PageRef::parse(&page).is_err());
    }

    #[test]
    fn test_compact_expand_round_trip() {
        let items = vec![leaf(b"a", b"1"), leaf(b"b", b"2")];
        let mut page = vec![0u8; PAGE];
        encode_leaf(&mut page, &items).expect("encode");

        let small = compact(&page).expect("compact");
        assert!(small.len() < page.len());
        let back = expand(&small, PAGE).expect("expand");
        assert_eq!(back, page);
    }

    #[test]
    fn test_compact_expand_empty() {
        let mut page = vec![0u8; PAGE];
        encode_empty_leaf(&mut page);
        let small = compact(&page).expect("compact");
        assert_eq!(small.len(), HEAD_SIZE);
        let back = expand(&small, PAGE).expect("expand");
        assert_eq!(back, page);
    }

    #[test]
    fn test_inline_sizes_hold_their_guarantees() {
        for page_size in [508usize, 4092, 16380, 65532] {
            let (key_inline, val_inline) = inline_sizes(page_size, BRANCH_FACTOR);
            // branch_factor worst-case branch items fit one page.
            let branch_worst = BRANCH_ITEM_OVERHEAD + key_inline;
            assert!(
                HEAD_SIZE + BRANCH_FACTOR * branch_worst <= page_size,
                "branch guarantee broken at {page_size}"
            );
            // Two worst-case leaf items fit one page.
            let leaf_worst = LEAF_ITEM_OVERHEAD + key_inline + val_inline;
            assert!(
                HEAD_SIZE + 2 * leaf_worst <= page_size,
                "leaf guarantee broken at {page_size}"
            );
        }
    }
}
