//! Summary: Meta record TLV codec and the alternating-slot selection rule.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Blocks 0 and 1 each hold one meta record: a 4-byte magic, a TLV region
//! with signed varint keys (negative keys prefix a length-delimited byte
//! field), a zero-key terminator, and a CRC32C over the TLV region. The
//! slot with the larger checkpoint number wins, with a wrap-around rule so
//! checkpoint 0 supersedes checkpoint `u32::MAX`.

use crate::error::{Error, MetaFault, Result};
use crate::varint::{read_ivarint, read_uvarint, write_ivarint, write_uvarint};

const KEY_VERSION: i64 = 1;
const KEY_CKP: i64 = 5;
const KEY_UPDATE_TIME: i64 = 6;
const KEY_BLOCK_SIZE: i64 = 7;
const KEY_BLOCK_COUNT: i64 = 8;
const KEY_ID: i64 = 9;
const KEY_PREV_ID: i64 = 10;
const KEY_FREE_RECYCLED: i64 = 11;
const KEY_FREE_TOTAL: i64 = 12;
const KEY_FREELIST: i64 = 13;
const KEY_ENTRY_SIZE: i64 = 14;
const KEY_ENTRY_ID: i64 = 15;
const KEY_ENTRY: i64 = 16;
const KEY_CODEC_SPEC: i64 = 17;

/// Supported meta format version.
pub const META_VERSION: u64 = 0;

/// One decoded meta record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub version: u64,
    /// Checkpoint number; also selects the slot (`ckp % 2`).
    pub ckp: u32,
    /// Commit wall-clock time in milliseconds.
    pub update_time: i64,
    pub block_size: u32,
    pub block_count: u32,
    /// Block holding this meta's historical copy (0 while it is current).
    pub id: u32,
    /// Block holding the previous meta's historical copy (0 if none).
    pub prev_id: u32,
    /// Blocks recycled since this checkpoint.
    pub free_recycled: u32,
    /// Total free blocks excluding `free_recycled`.
    pub free_total: u32,
    /// Inline freelist page, chained to older pages by its `prev` field.
    pub freelist: Vec<u8>,
    /// Total size of the sealed entry.
    pub entry_size: u32,
    /// First block of the entry overflow chain (0 when fully inline).
    pub entry_id: u32,
    /// Entry bytes, or the inline prefix when `entry_id != 0`.
    pub entry: Vec<u8>,
    /// Codec spec: `None` plain CRC32, empty CRC32 AEAD, varint cipher id.
    pub codec_spec: Option<Vec<u8>>,
}

impl Meta {
    /// Encodes the record: magic, TLV fields, terminator, CRC32C.
    pub fn encode(&self, magic: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.freelist.len() + self.entry.len());
        out.extend_from_slice(&magic);

        write_field_u64(&mut out, KEY_VERSION, self.version);
        write_ivarint(&mut out, KEY_CKP);
        write_uvarint(&mut out, u64::from(self.ckp));
        if self.update_time != 0 {
            write_ivarint(&mut out, KEY_UPDATE_TIME);
            write_ivarint(&mut out, self.update_time);
        }
        write_field_u64(&mut out, KEY_BLOCK_SIZE, u64::from(self.block_size));
        write_field_u64(&mut out, KEY_BLOCK_COUNT, u64::from(self.block_count));
        write_field_u64(&mut out, KEY_ID, u64::from(self.id));
        write_field_u64(&mut out, KEY_PREV_ID, u64::from(self.prev_id));
        write_field_u64(&mut out, KEY_FREE_RECYCLED, u64::from(self.free_recycled));
        write_field_u64(&mut out, KEY_FREE_TOTAL, u64::from(self.free_total));
        if !self.freelist.is_empty() {
            write_field_bytes(&mut out, KEY_FREELIST, &self.freelist);
        }
        write_field_u64(&mut out, KEY_ENTRY_SIZE, u64::from(self.entry_size));
        write_field_u64(&mut out, KEY_ENTRY_ID, u64::from(self.entry_id));
        if !self.entry.is_empty() {
            write_field_bytes(&mut out, KEY_ENTRY, &self.entry);
        }
        if let Some(spec) = &self.codec_spec {
            write_field_bytes(&mut out, KEY_CODEC_SPEC, spec);
        }

        // Terminator, then CRC32C over the TLV region including it.
        write_ivarint(&mut out, 0);
        let crc = crc32c::crc32c(&out[4..]);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes a record from the front of `buf`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownMagicCode`] when the magic mismatches,
    /// [`Error::InvalidMeta`] for structural or checksum failures, and
    /// [`Error::Unsupported`] for a newer format version.
    pub fn decode(buf: &[u8], magic: [u8; 4]) -> Result<Meta> {
        if buf.len() < 4 || buf[..4] != magic {
            return Err(Error::UnknownMagicCode);
        }

        let bad = Error::InvalidMeta {
            fault: MetaFault::Checksum,
        };
        let mut meta = Meta::default();
        let mut pos = 4usize;
        loop {
            let (key, n) = read_ivarint(&buf[pos..]).ok_or(bad.clone())?;
            pos += n;
            if key == 0 {
                break;
            }
            if key > 0 {
                let (v, n) = read_uvarint(&buf[pos..]).ok_or(bad.clone())?;
                pos += n;
                match key {
                    KEY_VERSION => meta.version = v,
                    KEY_CKP => meta.ckp = as_u32(v, MetaFault::Checksum)?,
                    KEY_UPDATE_TIME => meta.update_time = unzig(v),
                    KEY_BLOCK_SIZE => meta.block_size = as_u32(v, MetaFault::Checksum)?,
                    KEY_BLOCK_COUNT => meta.block_count = as_u32(v, MetaFault::Checksum)?,
                    KEY_ID => meta.id = as_u32(v, MetaFault::Checksum)?,
                    KEY_PREV_ID => meta.prev_id = as_u32(v, MetaFault::Checksum)?,
                    KEY_FREE_RECYCLED => meta.free_recycled = as_u32(v, MetaFault::Checksum)?,
                    KEY_FREE_TOTAL => meta.free_total = as_u32(v, MetaFault::Checksum)?,
                    KEY_ENTRY_SIZE => meta.entry_size = as_u32(v, MetaFault::EntrySize)?,
                    KEY_ENTRY_ID => meta.entry_id = as_u32(v, MetaFault::EntryId)?,
                    _ => {}
                }
            } else {
                let (len, n) = read_uvarint(&buf[pos..]).ok_or(bad.clone())?;
                pos += n;
                let len = len as usize;
                if pos + len > buf.len() {
                    return Err(bad);
                }
                let bytes = &buf[pos..pos + len];
                pos += len;
                match -key {
                    k if k == KEY_FREELIST => meta.freelist = bytes.to_vec(),
                    k if k == KEY_ENTRY => meta.entry = bytes.to_vec(),
                    k if k == KEY_CODEC_SPEC => meta.codec_spec = Some(bytes.to_vec()),
                    _ => {}
                }
            }
        }

        if pos + 4 > buf.len() {
            return Err(bad);
        }
        let stored = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        let crc = crc32c::crc32c(&buf[4..pos]);
        if crc != stored {
            return Err(bad);
        }

        if meta.version > META_VERSION {
            return Err(Error::Unsupported {
                what: "meta format version",
            });
        }
        Ok(meta)
    }
}

/// True if checkpoint number `a` supersedes `b`.
///
/// The numbers alternate between two slots, so the usual ordering applies
/// except across the `u32` wrap: `0` supersedes `u32::MAX`.
pub fn supersedes(a: u32, b: u32) -> bool {
    if a == b.wrapping_add(1) {
        true
    } else if b == a.wrapping_add(1) {
        false
    } else {
        a > b
    }
}

fn write_field_u64(out: &mut Vec<u8>, key: i64, v: u64) {
    if v != 0 {
        write_ivarint(out, key);
        write_uvarint(out, v);
    }
}

fn write_field_bytes(out: &mut Vec<u8>, key: i64, bytes: &[u8]) {
    write_ivarint(out, -key);
    write_uvarint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Narrows a decoded field to `u32`, reporting an overflow under the
/// fault that names the field (the entry fields have their own sub-kinds).
fn as_u32(v: u64, fault: MetaFault) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::InvalidMeta { fault })
}

/// The update-time value travels zigzag-encoded inside a uvarint field.
fn unzig(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = *b"DICT";

    fn sample() -> Meta {
        Meta {
            version: 0,
            ckp: 42,
            update_time: 0,
            block_size: 16384,
            block_count: 100,
            id: 0,
            prev_id: 55,
            free_recycled: 3,
            free_total: 7,
            freelist: vec![1, 2, 3, 4],
            entry_size: 64,
            entry_id: 0,
            entry: vec![9; 64],
            codec_spec: None,
        }
    }

    #[test]
    fn test_meta_round_trip() {
        let meta = sample();
        let buf = meta.encode(MAGIC);
        let back = Meta::decode(&buf, MAGIC).expect("decode");
        assert_eq!(back, meta);
    }

    #[test]
    fn test_meta_round_trip_with_codec_spec() {
        let mut meta = sample();
        meta.codec_spec = Some(Vec::new());
        let buf = meta.encode(MAGIC);
        let back = Meta::decode(&buf, MAGIC).expect("decode");
        assert_eq!(back.codec_spec, Some(Vec::new()));
    }

    #[test]
    fn test_meta_update_time_negative() {
        let mut meta = sample();
        meta.update_time = -12345;
        let buf = meta.encode(MAGIC);
        let back = Meta::decode(&buf, MAGIC).expect("decode");
        assert_eq!(back.update_time, -12345);
    }

    #[test]
    fn test_meta_wrong_magic() {
        let meta = sample();
        let buf = meta.encode(MAGIC);
        assert!(matches!(
            Meta::decode(&buf, *b"XXXX"),
            Err(Error::UnknownMagicCode)
        ));
    }

    #[test]
    fn test_meta_crc_corruption() {
        let meta = sample();
        let mut buf = meta.encode(MAGIC);
        let n = buf.len();
        buf[n - 1] ^= 0xFF;
        assert!(matches!(
            Meta::decode(&buf, MAGIC),
            Err(Error::InvalidMeta {
                fault: MetaFault::Checksum
            })
        ));
    }

    #[test]
    fn test_meta_body_corruption() {
        let meta = sample();
        let mut buf = meta.encode(MAGIC);
        buf[10] ^= 0xFF;
        assert!(Meta::decode(&buf, MAGIC).is_err());
    }

    #[test]
    fn test_meta_future_version_rejected() {
        let mut meta = sample();
        meta.version = 9;
        let buf = meta.encode(MAGIC);
        assert!(matches!(
            Meta::decode(&buf, MAGIC),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn test_supersedes_plain_ordering() {
        assert!(supersedes(5, 4));
        assert!(!supersedes(4, 5));
        assert!(!supersedes(4, 4));
    }

    #[test]
    fn test_supersedes_wraparound() {
        // Checkpoint 0 supersedes u32::MAX across the wrap.
        assert!(supersedes(0, u32::MAX));
        assert!(!supersedes(u32::MAX, 0));
    }

    #[test]
    fn test_entry_field_overflow_names_the_field() {
        // A value past u32 in the entry-size or entry-id field must fault
        // as that field, not as a checksum failure.
        let craft = |key: i64| {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC);
            write_ivarint(&mut buf, key);
            write_uvarint(&mut buf, u64::from(u32::MAX) + 1);
            write_ivarint(&mut buf, 0);
            let crc = crc32c::crc32c(&buf[4..]);
            buf.extend_from_slice(&crc.to_le_bytes());
            buf
        };

        assert!(matches!(
            Meta::decode(&craft(KEY_ENTRY_SIZE), MAGIC),
            Err(Error::InvalidMeta {
                fault: MetaFault::EntrySize
            })
        ));
        assert!(matches!(
            Meta::decode(&craft(KEY_ENTRY_ID), MAGIC),
            Err(Error::InvalidMeta {
                fault: MetaFault::EntryId
            })
        ));
    }

    #[test]
    fn test_meta_trailing_padding_ignored() {
        let meta = sample();
        let mut buf = meta.encode(MAGIC);
        buf.resize(buf.len() + 512, 0);
        let back = Meta::decode(&buf, MAGIC).expect("decode with padding");
        assert_eq!(back, meta);
    }
}
