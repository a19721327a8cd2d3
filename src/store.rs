//! Summary: Paged block store with copy-on-write checkpointing.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The store partitions a [`StorageFile`] into fixed-size blocks. Blocks 0
//! and 1 hold alternating meta records; blocks from 2 up carry payload.
//! Every commit writes the meta into slot `ckp % 2` and advances a
//! reference-counted checkpoint chain; recycled blocks are reissued only
//! once the checkpoint that was live when they were freed (and every older
//! one) has been released.
//!
//! # Concurrency
//!
//! One writer at a time (the caller serializes mutations); block reads may
//! run concurrently with the writer and with each other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::checkpoint::{Checkpoint, Node};
use crate::codec::{BlockCodec, CodecSpec};
use crate::error::{Error, MetaFault, Result};
use crate::file::StorageFile;
use crate::freelist::{self, FreeRing};
use crate::meta::{self, Meta};
use crate::overflow;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;
/// Default block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;
/// Default magic code at the head of both meta slots.
pub const DEFAULT_MAGIC: [u8; 4] = *b"DICT";

/// Blocks added at most by one file growth step.
const MAX_GROW_BLOCKS: u64 = 65536;
/// Page buffers kept in the pool.
const MAX_POOLED_BUFFERS: usize = 64;
/// Headroom for field framing when sizing the meta record.
const META_SLACK: usize = 24;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub block_size: u32,
    pub read_only: bool,
    /// Historical checkpoints kept readable behind the live one.
    pub retain_checkpoints: usize,
    /// Discard a corrupt freelist chain instead of failing the load.
    pub ignore_invalid_freelist: bool,
    pub magic: [u8; 4],
    pub codec: CodecSpec,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            read_only: false,
            retain_checkpoints: 0,
            ignore_invalid_freelist: false,
            magic: DEFAULT_MAGIC,
            codec: CodecSpec::PlainCrc32,
        }
    }
}

impl Options {
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    pub fn retain_checkpoints(mut self, n: usize) -> Self {
        self.retain_checkpoints = n;
        self
    }

    pub fn ignore_invalid_freelist(mut self, yes: bool) -> Self {
        self.ignore_invalid_freelist = yes;
        self
    }

    pub fn magic(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    pub fn codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)
    }
}

fn validate_block_size(size: u32) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) || !size.is_power_of_two() {
        return Err(Error::InvalidBlockSize { size });
    }
    Ok(())
}

/// Heap capability consumed by the overflow codec, the tree writer, and
/// cursors. [`Store`] is the production implementation.
pub trait Heap: Send + Sync {
    /// Usable payload bytes per block.
    fn page_size(&self) -> usize;

    /// Produces a block id from the free structure or by growing the file.
    /// The flag reports whether the block was reused.
    fn allocate(&self) -> Result<(u32, bool)>;

    /// Returns a block to the free structure, charged to the live
    /// checkpoint.
    fn recycle(&self, block_id: u32) -> Result<()>;

    /// Reads and verifies a sealed block into `buf` (one block long); the
    /// payload is `buf[..page_size()]`.
    fn read_block(&self, block_id: u32, buf: &mut [u8]) -> Result<()>;

    /// Seals `buf` in place and writes it to `block_id`.
    fn write_block(&self, block_id: u32, buf: &mut [u8]) -> Result<()>;

    /// Takes a zeroed block-sized buffer from the pool.
    fn allocate_buffer(&self) -> Vec<u8>;

    /// Returns a buffer to the pool.
    fn recycle_buffer(&self, buf: Vec<u8>);
}

/// A store-held handle on one retained checkpoint.
struct Retained {
    checkpoint: Checkpoint,
    /// Block holding this checkpoint's meta copy, 0 for the live one.
    history_id: u32,
}

/// Free-structure state as of the last durable commit, restored verbatim
/// by `rollback`.
struct CommittedState {
    ring: Vec<u32>,
    counts: Vec<(Arc<Node>, u32)>,
    head: Arc<Node>,
}

struct State {
    meta: Meta,
    block_count: u32,
    physical_blocks: u64,
    ring: FreeRing,
    /// Oldest chain node not yet fully consumed by the allocator.
    head: Arc<Node>,
    /// Store-pinned checkpoints; front is the base, back the live tail.
    retained: VecDeque<Retained>,
    /// Blocks referenced only by the on-disk meta generation (entry
    /// chain, freelist chain, departed history); reclaimed next commit.
    prior_blocks: Vec<u32>,
    committed: CommittedState,
}

impl State {
    fn tail_node(&self) -> Arc<Node> {
        self.retained
            .back()
            .map(|r| r.checkpoint.node().clone())
            .unwrap_or_else(|| self.head.clone())
    }

    fn capture_committed(&mut self) {
        let mut counts = Vec::new();
        let mut cursor = Some(self.head.clone());
        while let Some(node) = cursor {
            counts.push((node.clone(), node.recycled()));
            cursor = node.successor();
        }
        self.committed = CommittedState {
            ring: self.ring.to_vec(),
            counts,
            head: self.head.clone(),
        };
    }
}

/// The block store: a heap of fixed-size blocks with checkpointed reuse.
pub struct Store<F: StorageFile> {
    file: F,
    codec: Arc<dyn BlockCodec>,
    codec_spec_field: Option<Vec<u8>>,
    magic: [u8; 4],
    block_size: u32,
    page_size: usize,
    read_only: bool,
    retain: usize,
    ignore_invalid_freelist: bool,
    /// Worst-case encoded size of the meta minus its byte fields.
    fixed_meta_len: usize,
    state: Mutex<State>,
    /// Shadow of `State::block_count` so reads skip the writer lock.
    blocks: AtomicU32,
    phase: OnceLock<Error>,
    closed: AtomicBool,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl<F: StorageFile> Store<F> {
    /// Opens the store, initializing an empty file when writable.
    ///
    /// Returns the store, the decoded entry of the selected checkpoint
    /// (empty for a fresh store), and a caller-owned handle on the live
    /// checkpoint.
    pub fn load(file: F, options: Options) -> Result<(Store<F>, Vec<u8>, Checkpoint)> {
        options.validate()?;
        let file_len = file.len().map_err(|e| Error::io("reading file length", e))?;
        if file_len == 0 {
            if options.read_only {
                return Err(Error::FileEmpty);
            }
            return Self::init(file, options);
        }

        // Slot 0 teaches us the real block size; slot 1 sits one block in.
        let head_len = file_len.min(u64::from(MAX_BLOCK_SIZE)) as usize;
        let mut buf0 = vec![0u8; head_len];
        file.read_at(&mut buf0, 0)
            .map_err(|e| Error::io("reading meta slot 0", e))?;
        let meta0 = Meta::decode(&buf0, options.magic);

        let bs = match &meta0 {
            Ok(m) => m.block_size,
            Err(_) => options.block_size,
        };
        validate_block_size(bs)?;

        let meta1 = if file_len >= 2 * u64::from(bs) {
            let mut buf1 = vec![0u8; bs as usize];
            file.read_at(&mut buf1, u64::from(bs))
                .map_err(|e| Error::io("reading meta slot 1", e))?;
            Meta::decode(&buf1, options.magic)
        } else {
            Err(Error::FileTruncated {
                expected: 2 * u64::from(bs),
                actual: file_len,
            })
        };

        let current = match (meta0, meta1) {
            (Ok(a), Ok(b)) => {
                if meta::supersedes(a.ckp, b.ckp) {
                    a
                } else {
                    b
                }
            }
            (Ok(a), Err(_)) => a,
            (Err(_), Ok(b)) => b,
            (Err(e), Err(_)) => return Err(e),
        };

        validate_block_size(current.block_size)?;
        if current.block_count < 2 {
            return Err(Error::InvalidMeta {
                fault: MetaFault::Checksum,
            });
        }
        let expected = u64::from(current.block_count) * u64::from(current.block_size);
        if expected > file_len {
            return Err(Error::FileTruncated {
                expected,
                actual: file_len,
            });
        }

        let key = match &options.codec {
            CodecSpec::Cipher { key, .. } => Some(key.as_slice()),
            _ => None,
        };
        let spec = CodecSpec::from_meta_field(current.codec_spec.as_deref(), key)?;
        let codec = spec.build()?;

        let mut store = Self::build(file, options, codec, current.clone());
        store.state.get_mut().unwrap().physical_blocks =
            file_len / u64::from(current.block_size);

        let history = store.replay_history(&current)?;
        store.restore_free_structure(&current, &history)?;
        let prior = store.derive_prior_blocks(&current, &history)?;
        store.state.get_mut().unwrap().prior_blocks = prior;
        let entry = store.assemble_entry(&current)?;
        store.state.get_mut().unwrap().capture_committed();

        let caller = {
            let state = store.state.get_mut().unwrap();
            state
                .retained
                .back()
                .map(|r| r.checkpoint.acquire())
                .ok_or(Error::AllocateFailed {
                    reason: "checkpoint chain empty",
                })?
        };
        debug!(
            "loaded store at checkpoint {} with {} blocks",
            current.ckp, current.block_count
        );
        Ok((store, entry, caller))
    }

    fn init(file: F, options: Options) -> Result<(Store<F>, Vec<u8>, Checkpoint)> {
        let codec = options.codec.build()?;
        let bs = options.block_size;
        let meta = Meta {
            version: meta::META_VERSION,
            ckp: 0,
            update_time: now_millis(),
            block_size: bs,
            block_count: 2,
            codec_spec: options.codec.to_meta_field(),
            ..Meta::default()
        };

        let mut slot0 = vec![0u8; bs as usize];
        let encoded = meta.encode(options.magic);
        slot0[..encoded.len()].copy_from_slice(&encoded);
        file.write_at(&slot0, 0)
            .map_err(|e| Error::io("writing initial meta slot 0", e))?;

        // Slot 1 carries only the magic until the first commit lands there.
        let mut slot1 = vec![0u8; bs as usize];
        slot1[..4].copy_from_slice(&options.magic);
        file.write_at(&slot1, u64::from(bs))
            .map_err(|e| Error::io("writing initial meta slot 1", e))?;
        file.sync()
            .map_err(|e| Error::io("syncing initial meta slots", e))?;

        let mut store = Self::build(file, options, codec, meta);
        {
            let state = store.state.get_mut().unwrap();
            state.physical_blocks = 2;
            state.capture_committed();
        }
        let caller = {
            let state = store.state.get_mut().unwrap();
            state.retained.back().unwrap().checkpoint.acquire()
        };
        debug!("initialized new store, block size {bs}");
        Ok((store, Vec::new(), caller))
    }

    fn build(file: F, options: Options, codec: Arc<dyn BlockCodec>, current: Meta) -> Store<F> {
        let page_size = current.block_size as usize - codec.overhead();
        let head = Node::new();
        let tail_node = Node::new();
        head.link(tail_node.clone());
        let mut retained = VecDeque::new();
        retained.push_back(Retained {
            checkpoint: Checkpoint::adopt(tail_node),
            history_id: 0,
        });

        let codec_spec_field = current.codec_spec.clone();
        let fixed_meta_len = worst_fixed_meta_len(&codec_spec_field);
        let block_count = current.block_count;
        let block_size = current.block_size;

        Store {
            file,
            codec,
            codec_spec_field,
            magic: options.magic,
            block_size,
            page_size,
            read_only: options.read_only,
            retain: options.retain_checkpoints,
            ignore_invalid_freelist: options.ignore_invalid_freelist,
            fixed_meta_len,
            state: Mutex::new(State {
                meta: current,
                block_count,
                physical_blocks: 0,
                ring: FreeRing::new(),
                head: head.clone(),
                retained,
                prior_blocks: Vec::new(),
                committed: CommittedState {
                    ring: Vec::new(),
                    counts: Vec::new(),
                    head,
                },
            }),
            blocks: AtomicU32::new(block_count),
            phase: OnceLock::new(),
            closed: AtomicBool::new(false),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Reads a history block holding a retained meta copy.
    fn read_meta_copy(&self, block_id: u32) -> Result<Meta> {
        let mut buf = self.allocate_buffer();
        let res = self
            .read_block(block_id, &mut buf)
            .and_then(|()| Meta::decode(&buf[..self.page_size], self.magic));
        self.recycle_buffer(buf);
        res
    }

    /// Replays up to `retain` historical metas following `prev_id`,
    /// newest first.
    fn replay_history(&self, current: &Meta) -> Result<Vec<(Meta, u32)>> {
        let mut history = Vec::new();
        let mut prev = current.prev_id;
        while history.len() < self.retain && prev != 0 {
            let copy = self.read_meta_copy(prev)?;
            let older = copy.prev_id;
            history.push((copy, prev));
            prev = older;
        }
        Ok(history)
    }

    /// Rebuilds the ring and the checkpoint chain from the selected meta
    /// and its replayed history.
    fn restore_free_structure(&mut self, current: &Meta, history: &[(Meta, u32)]) -> Result<()> {
        let restore = self.read_free_chain(current);
        let (ring, _chain_blocks) = match restore {
            Ok(v) => v,
            Err(e @ Error::InvalidFreelist { .. }) if self.ignore_invalid_freelist => {
                warn!("discarding freelist: {e}");
                (Vec::new(), Vec::new())
            }
            Err(e) => return Err(e),
        };
        let discarded = ring.is_empty()
            && u64::from(current.free_total) + u64::from(current.free_recycled) > 0;

        let sum_hist: u64 = history.iter().map(|(m, _)| u64::from(m.free_recycled)).sum();
        let head_charge = if discarded {
            0
        } else {
            match u64::from(current.free_total).checked_sub(sum_hist) {
                Some(v) => v as u32,
                None => {
                    if self.ignore_invalid_freelist {
                        warn!("discarding freelist: retained counts exceed free total");
                        0
                    } else {
                        return Err(Error::InvalidFreelist {
                            reason: "retained counts exceed free total",
                        });
                    }
                }
            }
        };

        let head = Node::new();
        head.set_recycled(head_charge);
        let mut cursor = head.clone();
        let mut retained = VecDeque::new();
        for (m, hid) in history.iter().rev() {
            let node = Node::new();
            node.set_recycled(if discarded { 0 } else { m.free_recycled });
            cursor.link(node.clone());
            retained.push_back(Retained {
                checkpoint: Checkpoint::adopt(node.clone()),
                history_id: *hid,
            });
            cursor = node;
        }
        let tail = Node::new();
        tail.set_recycled(if discarded { 0 } else { current.free_recycled });
        cursor.link(tail.clone());
        retained.push_back(Retained {
            checkpoint: Checkpoint::adopt(tail),
            history_id: 0,
        });

        let state = self.state.get_mut().unwrap();
        state.ring.restore(if discarded { Vec::new() } else { ring });
        state.head = head;
        state.retained = retained;
        Ok(())
    }

    /// Decodes the inline freelist page and folds in the chained pages,
    /// oldest ids ending up at the front. Returns the ids and the chain's
    /// block ids.
    fn read_free_chain(&self, m: &Meta) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut ring: Vec<u32> = Vec::new();
        let mut chain_blocks = Vec::new();
        let mut prev = if m.freelist.is_empty() {
            0
        } else {
            let (ids, prev) = freelist::decode_page(&m.freelist)?;
            ring = ids;
            prev
        };

        let mut hops = 0u32;
        while prev != 0 {
            if prev < 2 || prev >= m.block_count {
                return Err(Error::InvalidFreelist {
                    reason: "chain block id out of range",
                });
            }
            hops += 1;
            if hops > m.block_count {
                return Err(Error::InvalidFreelist {
                    reason: "chain longer than the heap",
                });
            }
            let mut buf = self.allocate_buffer();
            let res = self
                .read_block(prev, &mut buf)
                .and_then(|()| freelist::decode_page(&buf[..self.page_size]));
            self.recycle_buffer(buf);
            let (ids, older) = match res {
                Ok(v) => v,
                Err(Error::InvalidChecksum { .. }) => {
                    return Err(Error::InvalidFreelist {
                        reason: "chain block failed verification",
                    });
                }
                Err(e) => return Err(e),
            };
            chain_blocks.push(prev);
            let mut merged = ids;
            merged.extend_from_slice(&ring);
            ring = merged;
            prev = older;
        }

        let expected = u64::from(m.free_total) + u64::from(m.free_recycled);
        if ring.len() as u64 != expected {
            return Err(Error::InvalidFreelist {
                reason: "id count disagrees with the meta",
            });
        }
        for &id in &ring {
            if id < 2 || id >= m.block_count {
                return Err(Error::InvalidFreelist {
                    reason: "free id out of range",
                });
            }
        }
        Ok((ring, chain_blocks))
    }

    /// Collects the blocks only the current meta generation references:
    /// the freelist chain, the entry overflow chain, and the history block
    /// that has departed the retention window. The next commit recycles
    /// them all.
    fn derive_prior_blocks(&self, m: &Meta, history: &[(Meta, u32)]) -> Result<Vec<u32>> {
        let mut prior = match self.read_free_chain(m) {
            Ok((_, blocks)) => blocks,
            Err(_) => Vec::new(),
        };
        if m.entry_id != 0 {
            prior.extend(overflow::chain_blocks(self, m.entry_id)?);
        }
        if self.retain > 0 && history.len() == self.retain {
            if let Some((last, _)) = history.last() {
                if last.prev_id != 0 {
                    prior.push(last.prev_id);
                }
            }
        }
        Ok(prior)
    }

    /// Reassembles and verifies the sealed entry, returning its payload.
    fn assemble_entry(&self, m: &Meta) -> Result<Vec<u8>> {
        if m.entry_size == 0 {
            return Ok(Vec::new());
        }
        let sealed = if m.entry_id == 0 {
            if m.entry.len() != m.entry_size as usize {
                return Err(Error::InvalidMeta {
                    fault: MetaFault::EntrySize,
                });
            }
            m.entry.clone()
        } else {
            if m.entry_id < 2 || m.entry_id >= m.block_count {
                return Err(Error::InvalidMeta {
                    fault: MetaFault::EntryId,
                });
            }
            let overflow_len = (m.entry_size as usize)
                .checked_sub(m.entry.len())
                .ok_or(Error::InvalidMeta {
                    fault: MetaFault::EntrySize,
                })?;
            let mut out = Vec::with_capacity(m.entry_size as usize);
            overflow::read_into(self, &m.entry, overflow_len as u32, m.entry_id, &mut out)?;
            if out.len() != m.entry_size as usize {
                return Err(Error::InvalidMeta {
                    fault: MetaFault::EntrySize,
                });
            }
            out
        };

        let overhead = self.codec.overhead();
        if sealed.len() < overhead {
            return Err(Error::InvalidMeta {
                fault: MetaFault::EntrySize,
            });
        }
        let slot = m.ckp % 2;
        if self.codec.open(slot, &sealed).is_err() {
            return Err(Error::InvalidMeta {
                fault: MetaFault::Entry,
            });
        }
        Ok(sealed[..sealed.len() - overhead].to_vec())
    }

    /// Raw block size of this store's file layout.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of blocks the store currently addresses.
    pub fn block_count(&self) -> u32 {
        self.blocks.load(Ordering::Acquire)
    }

    /// Latched first write error, if any.
    pub fn phase_error(&self) -> Option<Error> {
        self.phase.get().cloned()
    }

    /// Checkpoint number of the currently committed meta.
    pub fn checkpoint_number(&self) -> u32 {
        self.state.lock().unwrap().meta.ckp
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if let Some(e) = self.phase.get() {
            return Err(e.clone());
        }
        Ok(())
    }

    fn latch(&self, e: Error) -> Error {
        let _ = self.phase.set(e.clone());
        e
    }

    /// Commits `entry` as the new checkpoint.
    ///
    /// Seals the entry, places it inline or behind an overflow chain,
    /// persists the free ring, copies the previous meta into a history
    /// block when retention is on, writes the new meta into slot
    /// `ckp % 2`, syncs, and advances the checkpoint chain.
    ///
    /// # Errors
    ///
    /// Any failure after storage has been touched latches the store; later
    /// writes fail with the same error until close. Reads stay usable.
    pub fn commit(&self, entry: &[u8]) -> Result<(Meta, Checkpoint)> {
        self.check_writable()?;
        match self.commit_inner(entry) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.latch(e)),
        }
    }

    fn commit_inner(&self, entry: &[u8]) -> Result<(Meta, Checkpoint)> {
        // Blocks only the outgoing meta references join the free ring now,
        // charged to the checkpoint being superseded.
        let prior: Vec<u32> = {
            let mut st = self.state.lock().unwrap();
            std::mem::take(&mut st.prior_blocks)
        };
        for id in prior {
            self.recycle(id)?;
        }

        let prev_ckp = self.state.lock().unwrap().meta.ckp;
        let next_ckp = prev_ckp.wrapping_add(1);
        let slot = next_ckp % 2;
        let cap = self.page_size;

        // Seal the entry against the destination slot id.
        let overhead = self.codec.overhead();
        let sealed = if entry.is_empty() {
            Vec::new()
        } else {
            let mut b = Vec::with_capacity(entry.len() + overhead);
            b.extend_from_slice(entry);
            b.resize(entry.len() + overhead, 0);
            self.codec.seal(slot, &mut b);
            b
        };

        // Entry placement: fully inline when it fits next to the whole
        // ring, otherwise an inline prefix plus an overflow chain.
        let mut new_entry_blocks: Vec<u32> = Vec::new();
        let ring_len = self.state.lock().unwrap().ring.len();
        let all_inline =
            self.fixed_meta_len + sealed.len() + freelist::encoded_len(ring_len) <= cap;
        let (entry_field, entry_id) = if all_inline || sealed.is_empty() {
            (sealed.clone(), 0u32)
        } else {
            let reserve = self.fixed_meta_len + freelist::encoded_len(0);
            let prefix_len = cap.saturating_sub(reserve).min(sealed.len());
            if prefix_len == sealed.len() {
                (sealed.clone(), 0)
            } else {
                let (_, first) =
                    overflow::write(self, &sealed, prefix_len, &mut new_entry_blocks)?;
                (sealed[..prefix_len].to_vec(), first)
            }
        };

        // History copy of the outgoing meta.
        let history_id = if self.retain > 0 {
            let (hid, _) = self.allocate()?;
            let mut prev_meta = self.state.lock().unwrap().meta.clone();
            prev_meta.id = hid;
            let encoded = prev_meta.encode(self.magic);
            if encoded.len() > self.page_size {
                return Err(Error::OutOfRange {
                    what: "meta history copy",
                });
            }
            let mut buf = self.allocate_buffer();
            buf[..encoded.len()].copy_from_slice(&encoded);
            let res = self.write_block(hid, &mut buf);
            self.recycle_buffer(buf);
            res?;
            hid
        } else {
            0
        };

        // Freelist placement. Chaining allocates blocks which shrink the
        // ring, so iterate until the page count settles.
        let per_page = freelist::page_capacity(cap);
        let mut chain_ids: Vec<u32> = Vec::new();
        loop {
            let n = self.state.lock().unwrap().ring.len();
            let avail = cap
                .saturating_sub(self.fixed_meta_len)
                .saturating_sub(entry_field.len());
            let fits_inline = n == 0 || freelist::encoded_len(n) <= avail;
            if fits_inline && chain_ids.is_empty() {
                break;
            }
            let needed = n.div_ceil(per_page);
            if chain_ids.len() >= needed {
                break;
            }
            let (id, _) = self.allocate()?;
            chain_ids.push(id);
        }

        let ring_vec = self.state.lock().unwrap().ring.to_vec();
        let freelist_field = if chain_ids.is_empty() {
            if ring_vec.is_empty() {
                Vec::new()
            } else {
                freelist::encode_page(&ring_vec, 0)
            }
        } else {
            // Deepest page holds the oldest segment; over-allocated blocks
            // become empty pages at the deep end and are reclaimed next
            // commit like the rest of the chain.
            let segments: Vec<&[u32]> = ring_vec.chunks(per_page).collect();
            let extras = chain_ids.len().saturating_sub(segments.len());
            let mut prev = 0u32;
            for (i, &bid) in chain_ids.iter().enumerate() {
                let ids: &[u32] = if i < extras { &[] } else { segments[i - extras] };
                let body = freelist::encode_page(ids, prev);
                let mut buf = self.allocate_buffer();
                buf[..body.len()].copy_from_slice(&body);
                let res = self.write_block(bid, &mut buf);
                self.recycle_buffer(buf);
                res?;
                prev = bid;
            }
            freelist::encode_page(&[], prev)
        };

        // Assemble and persist the new meta.
        let new_meta = {
            let st = self.state.lock().unwrap();
            let tail = st.tail_node();
            let free_recycled = tail.recycled();
            let free_total = st.ring.len() as u32 - free_recycled;
            Meta {
                version: meta::META_VERSION,
                ckp: next_ckp,
                update_time: now_millis(),
                block_size: self.block_size,
                block_count: st.block_count,
                id: 0,
                prev_id: history_id,
                free_recycled,
                free_total,
                freelist: freelist_field,
                entry_size: sealed.len() as u32,
                entry_id,
                entry: entry_field,
                codec_spec: self.codec_spec_field.clone(),
            }
        };
        let encoded = new_meta.encode(self.magic);
        if encoded.len() > cap {
            return Err(Error::OutOfRange {
                what: "meta record size",
            });
        }
        let mut slot_buf = vec![0u8; self.block_size as usize];
        slot_buf[..encoded.len()].copy_from_slice(&encoded);
        self.file
            .write_at(&slot_buf, u64::from(slot) * u64::from(self.block_size))
            .map_err(|e| Error::io("writing meta slot", e))?;
        self.file
            .sync()
            .map_err(|e| Error::io("syncing commit", e))?;

        // Advance the checkpoint chain; the departing base's history block
        // joins the next generation's reclaim list.
        let caller = {
            let mut st = self.state.lock().unwrap();
            st.meta = new_meta.clone();
            st.prior_blocks = new_entry_blocks;
            st.prior_blocks.extend_from_slice(&chain_ids);

            let old_tail = st.tail_node();
            let new_node = Node::new();
            old_tail.link(new_node.clone());
            if history_id != 0 {
                if let Some(back) = st.retained.back_mut() {
                    back.history_id = history_id;
                }
            }
            st.retained.push_back(Retained {
                checkpoint: Checkpoint::adopt(new_node.clone()),
                history_id: 0,
            });
            while st.retained.len() > self.retain + 1 {
                let departing = st.retained.pop_front().unwrap();
                if departing.history_id != 0 {
                    st.prior_blocks.push(departing.history_id);
                }
            }
            st.capture_committed();
            Checkpoint::adopt(new_node)
        };

        debug!("committed checkpoint {next_ckp}");
        Ok((new_meta, caller))
    }

    /// Restores the last committed snapshot after a failed batch.
    ///
    /// Re-reads the current meta slot, rebuilds the free structure as of
    /// that commit, and re-derives the blocks the meta still references.
    /// A latched phase error stays latched.
    pub fn rollback(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let (slot, ckp) = {
            let st = self.state.lock().unwrap();
            (st.meta.ckp % 2, st.meta.ckp)
        };
        let mut slot_buf = vec![0u8; self.block_size as usize];
        self.file
            .read_at(&mut slot_buf, u64::from(slot) * u64::from(self.block_size))
            .map_err(|e| Error::io("re-reading meta slot", e))?;
        let disk_meta = Meta::decode(&slot_buf, self.magic)?;

        let restored = match self.read_free_chain(&disk_meta) {
            Ok((ids, _)) => Some(ids),
            Err(Error::InvalidFreelist { .. }) if self.ignore_invalid_freelist => None,
            Err(e) => return Err(e),
        };
        let history = self.replay_history(&disk_meta)?;
        let prior = self.derive_prior_blocks(&disk_meta, &history)?;

        let mut st = self.state.lock().unwrap();
        st.meta = disk_meta;
        st.block_count = st.meta.block_count;
        self.blocks.store(st.block_count, Ordering::Release);

        for (node, count) in &st.committed.counts {
            node.set_recycled(*count);
        }
        st.head = st.committed.head.clone();
        let committed_ring = st.committed.ring.clone();
        debug_assert!(
            restored
                .as_ref()
                .map(|ids| ids == &committed_ring)
                .unwrap_or(true),
            "disk freelist diverged from the committed snapshot"
        );
        st.ring.restore(committed_ring);
        st.prior_blocks = prior;

        debug!("rolled back to checkpoint {ckp}");
        Ok(())
    }

    /// Closes the store: drops every checkpoint pin, clears buffers, and
    /// fails all later operations with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        let mut st = self.state.lock().unwrap();
        st.retained.clear();
        let mut cursor = Some(st.head.clone());
        while let Some(node) = cursor {
            node.clear_refs();
            cursor = node.successor();
        }
        st.ring.clear();
        self.pool.lock().unwrap().clear();
        Ok(())
    }

    /// Walks the chain head-first: released checkpoints surrender their
    /// charged blocks oldest-first; the first pinned node stops the walk
    /// and the file grows instead.
    fn allocate_locked(&self, st: &mut State) -> Result<(u32, bool)> {
        loop {
            let head = st.head.clone();
            if head.refs() > 0 {
                break;
            }
            if head.recycled() == 0 {
                match head.successor() {
                    Some(next) => {
                        st.head = next;
                        continue;
                    }
                    None => break,
                }
            }
            head.take_recycled();
            let id = st.ring.pop_oldest().ok_or(Error::AllocateFailed {
                reason: "free accounting underflow",
            })?;
            return Ok((id, true));
        }

        if st.block_count == u32::MAX {
            return Err(Error::OutOfSpace);
        }
        if u64::from(st.block_count) >= st.physical_blocks {
            let grow = st.physical_blocks.clamp(1, MAX_GROW_BLOCKS);
            let new_physical = st.physical_blocks + grow;
            self.file
                .truncate(new_physical * u64::from(self.block_size))
                .map_err(|e| Error::io("growing file", e))?;
            st.physical_blocks = new_physical;
        }
        let id = st.block_count;
        st.block_count += 1;
        self.blocks.store(st.block_count, Ordering::Release);
        Ok((id, false))
    }
}

impl<F: StorageFile> Heap for Store<F> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> Result<(u32, bool)> {
        self.check_writable()?;
        let mut st = self.state.lock().unwrap();
        match self.allocate_locked(&mut st) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.latch(e)),
        }
    }

    fn recycle(&self, block_id: u32) -> Result<()> {
        self.check_writable()?;
        let mut st = self.state.lock().unwrap();
        if block_id < 2 || block_id >= st.block_count {
            return Err(self.latch(Error::OutOfRange {
                what: "recycled block id",
            }));
        }
        st.ring.push(block_id);
        st.tail_node().add_recycled(1);
        Ok(())
    }

    fn read_block(&self, block_id: u32, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        if block_id < 2 || block_id >= self.block_count() {
            return Err(Error::OutOfRange {
                what: "block id read",
            });
        }
        debug_assert_eq!(buf.len(), self.block_size as usize);
        self.file
            .read_at(buf, u64::from(block_id) * u64::from(self.block_size))
            .map_err(|e| Error::io("reading block", e))?;
        self.codec.open(block_id, buf)
    }

    fn write_block(&self, block_id: u32, buf: &mut [u8]) -> Result<()> {
        self.check_writable()?;
        if block_id < 2 || block_id >= self.block_count() {
            return Err(self.latch(Error::OutOfRange {
                what: "block id written",
            }));
        }
        debug_assert_eq!(buf.len(), self.block_size as usize);
        self.codec.seal(block_id, buf);
        self.file
            .write_at(buf, u64::from(block_id) * u64::from(self.block_size))
            .map_err(|e| self.latch(Error::io("writing block", e)))
    }

    fn allocate_buffer(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().unwrap();
        match pool.pop() {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; self.block_size as usize],
        }
    }

    fn recycle_buffer(&self, buf: Vec<u8>) {
        if buf.len() != self.block_size as usize {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(buf);
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Worst-case encoded size of a meta record without its variable byte
/// fields, used to budget the inline entry and freelist.
fn worst_fixed_meta_len(codec_spec: &Option<Vec<u8>>) -> usize {
    let worst = Meta {
        version: meta::META_VERSION,
        ckp: u32::MAX,
        update_time: i64::MIN,
        block_size: u32::MAX,
        block_count: u32::MAX,
        id: u32::MAX,
        prev_id: u32::MAX,
        free_recycled: u32::MAX,
        free_total: u32::MAX,
        freelist: Vec::new(),
        entry_size: u32::MAX,
        entry_id: u32::MAX,
        entry: Vec::new(),
        codec_spec: codec_spec.clone(),
    };
    worst.encode(DEFAULT_MAGIC).len() + META_SLACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfile::MemFile;

    fn open_mem(options: Options) -> (Store<MemFile>, Vec<u8>, Checkpoint, MemFile) {
        let file = MemFile::new();
        let (store, entry, ckp) =
            Store::load(file.clone(), options).expect("load should succeed");
        (store, entry, ckp, file)
    }

    fn small_options() -> Options {
        Options::default().block_size(512)
    }

    #[test]
    fn test_init_writes_both_slots() {
        let (_store, entry, _ckp, file) = open_mem(small_options());
        assert!(entry.is_empty());
        let data = file.contents();
        assert_eq!(data.len(), 1024);
        assert_eq!(&data[..4], b"DICT");
        assert_eq!(&data[512..516], b"DICT");
    }

    #[test]
    fn test_load_empty_read_only_fails() {
        let file = MemFile::new();
        let err = Store::load(file, small_options().read_only(true))
            .err()
            .expect("must fail");
        assert!(matches!(err, Error::FileEmpty));
    }

    #[test]
    fn test_commit_and_reload_entry() {
        let file = MemFile::new();
        {
            let (store, _, _ckp) =
                Store::load(file.clone(), small_options()).expect("load");
            store.commit(b"the entry").expect("commit");
        }
        let (_store, entry, _ckp) = Store::load(file, small_options()).expect("reload");
        assert_eq!(entry, b"the entry");
    }

    #[test]
    fn test_commit_alternates_slots() {
        let (store, _, _ckp, _file) = open_mem(small_options());
        let (m1, _c1) = store.commit(b"one").expect("commit 1");
        assert_eq!(m1.ckp, 1);
        let (m2, _c2) = store.commit(b"two").expect("commit 2");
        assert_eq!(m2.ckp, 2);
    }

    #[test]
    fn test_large_entry_spills_to_overflow() {
        let file = MemFile::new();
        let entry: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        {
            let (store, _, _ckp) =
                Store::load(file.clone(), small_options()).expect("load");
            let (meta, _c) = store.commit(&entry).expect("commit");
            assert_ne!(meta.entry_id, 0, "entry must overflow a 512B block");
        }
        let (_store, got, _ckp) = Store::load(file, small_options()).expect("reload");
        assert_eq!(got, entry);
    }

    #[test]
    fn test_allocate_grows_then_reuses() {
        let (store, _, ckp, _file) = open_mem(small_options());

        let (a, reused) = store.allocate().expect("allocate");
        assert_eq!(a, 2);
        assert!(!reused);
        let mut buf = store.allocate_buffer();
        store.write_block(a, &mut buf).expect("write");
        store.recycle_buffer(buf);

        store.recycle(a).expect("recycle");
        // Charged to the live checkpoint: not reusable yet.
        let (b, reused) = store.allocate().expect("allocate 2");
        assert_ne!(b, a);
        assert!(!reused);

        store.commit(b"x").expect("commit");
        // The old tail is still pinned by the load-time caller handle.
        let (c, reused) = store.allocate().expect("allocate 3");
        assert_ne!(c, a);
        assert!(!reused);

        drop(ckp);
        let (d, reused) = store.allocate().expect("allocate 4");
        assert_eq!(d, a);
        assert!(reused);
    }

    #[test]
    fn test_no_reuse_under_pin_across_commits() {
        let (store, _, ckp0, _file) = open_mem(small_options());
        let (a, _) = store.allocate().expect("allocate");
        store.recycle(a).expect("recycle");
        let (_, c1) = store.commit(b"one").expect("commit 1");
        let (_, c2) = store.commit(b"two").expect("commit 2");

        // ckp0 predates the recycle's checkpoint release; `a` stays pinned.
        for _ in 0..4 {
            let (id, _) = store.allocate().expect("allocate");
            assert_ne!(id, a);
        }
        drop(c1);
        drop(c2);
        drop(ckp0);
        let mut seen = false;
        for _ in 0..8 {
            let (id, reused) = store.allocate().expect("allocate");
            if id == a {
                assert!(reused);
                seen = true;
                break;
            }
        }
        assert!(seen, "block must become reusable after all pins drop");
    }

    #[test]
    fn test_free_accounting_round_trip() {
        let file = MemFile::new();
        {
            let (store, _, ckp) = Store::load(file.clone(), small_options()).expect("load");
            for _ in 0..5 {
                let (id, _) = store.allocate().expect("allocate");
                let mut buf = store.allocate_buffer();
                store.write_block(id, &mut buf).expect("write");
                store.recycle_buffer(buf);
                store.recycle(id).expect("recycle");
            }
            store.commit(b"entry").expect("commit");
            drop(ckp);
        }
        let (store, _, _ckp) = Store::load(file, small_options()).expect("reload");
        let st = store.state.lock().unwrap();
        let expected = st.meta.free_total + st.meta.free_recycled;
        assert_eq!(st.ring.len() as u32, expected);
        let mut sum = 0u32;
        let mut cursor = Some(st.head.clone());
        while let Some(node) = cursor {
            sum += node.recycled();
            cursor = node.successor();
        }
        assert_eq!(sum as usize, st.ring.len());
    }

    #[test]
    fn test_big_ring_chains_freelist_pages() {
        let file = MemFile::new();
        {
            let (store, _, ckp) = Store::load(file.clone(), small_options()).expect("load");
            let mut ids = Vec::new();
            for _ in 0..300 {
                let (id, _) = store.allocate().expect("allocate");
                let mut buf = store.allocate_buffer();
                store.write_block(id, &mut buf).expect("write");
                store.recycle_buffer(buf);
                ids.push(id);
            }
            for id in ids {
                store.recycle(id).expect("recycle");
            }
            let (meta, _c) = store.commit(b"entry").expect("commit");
            assert!(!meta.freelist.is_empty(), "inline page must link the chain");
            assert_eq!(
                u64::from(meta.free_total) + u64::from(meta.free_recycled),
                300
            );
            drop(ckp);
        }
        let (store, _, _ckp) = Store::load(file, small_options()).expect("reload");
        let st = store.state.lock().unwrap();
        assert_eq!(st.ring.len(), 300);
    }

    #[test]
    fn test_invalid_freelist_ignored_when_asked() {
        let file = MemFile::new();
        {
            let (store, _, _ckp) =
                Store::load(file.clone(), small_options()).expect("load");
            let (id, _) = store.allocate().expect("allocate");
            let mut buf = store.allocate_buffer();
            store.write_block(id, &mut buf).expect("write");
            store.recycle_buffer(buf);
            store.recycle(id).expect("recycle");
            store.commit(b"entry").expect("commit");
        }
        // Corrupt the free accounting in the current meta slot.
        let mut data = file.contents();
        let slot = 512usize;
        let meta = Meta::decode(&data[slot..slot + 512], DEFAULT_MAGIC).expect("meta");
        let mut bad = meta.clone();
        bad.free_total = 40;
        let enc = bad.encode(DEFAULT_MAGIC);
        data[slot..slot + 512].fill(0);
        data[slot..slot + enc.len()].copy_from_slice(&enc);
        file.set_contents(data);

        let err = Store::load(file.clone(), small_options())
            .err()
            .expect("strict load must fail");
        assert!(matches!(err, Error::InvalidFreelist { .. }));

        let (store, _, _ckp) =
            Store::load(file, small_options().ignore_invalid_freelist(true))
                .expect("lenient load");
        assert_eq!(store.state.lock().unwrap().ring.len(), 0);
    }

    #[test]
    fn test_meta_wrap_selects_zero() {
        // Hand-craft a file whose slot 0 carries ckp 0 and slot 1 carries
        // ckp u32::MAX; the wrap rule must pick slot 0.
        let mk = |ckp: u32| Meta {
            version: meta::META_VERSION,
            ckp,
            block_size: 512,
            block_count: 2,
            ..Meta::default()
        };
        let mut data = vec![0u8; 1024];
        let a = mk(0).encode(DEFAULT_MAGIC);
        let b = mk(u32::MAX).encode(DEFAULT_MAGIC);
        data[..a.len()].copy_from_slice(&a);
        data[512..512 + b.len()].copy_from_slice(&b);
        let file = MemFile::new();
        file.set_contents(data);

        let (store, _, _ckp) = Store::load(file, small_options()).expect("load");
        assert_eq!(store.state.lock().unwrap().meta.ckp, 0);
    }

    #[test]
    fn test_write_error_latches_phase() {
        let (store, _, _ckp, file) = open_mem(small_options());
        store.commit(b"ok").expect("first commit");

        // Cap the file so growth fails.
        file.set_capacity(Some(file.contents().len() as u64));
        let mut failed = false;
        for _ in 0..8 {
            if store.allocate().is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "growth must hit the cap");
        assert!(store.phase_error().is_some());

        // Later writes fail with the latched error; reads still work.
        assert!(store.commit(b"nope").is_err());
        let mut buf = store.allocate_buffer();
        let _ = store.read_block(2, &mut buf);
        store.recycle_buffer(buf);
        store.close().expect("close");
        assert!(matches!(store.commit(b"x"), Err(Error::Closed)));
    }

    #[test]
    fn test_rollback_restores_free_state() {
        let (store, _, ckp, _file) = open_mem(small_options());
        store.commit(b"base").expect("commit");
        drop(ckp);

        let before = {
            let st = store.state.lock().unwrap();
            (st.ring.to_vec(), st.block_count)
        };

        // A failed batch: allocate and recycle some blocks, then unwind.
        let (x, _) = store.allocate().expect("allocate");
        let mut buf = store.allocate_buffer();
        store.write_block(x, &mut buf).expect("write");
        store.recycle_buffer(buf);
        store.recycle(x).expect("recycle");
        store.rollback().expect("rollback");

        let after = {
            let st = store.state.lock().unwrap();
            (st.ring.to_vec(), st.block_count)
        };
        assert_eq!(before, after);
    }

    #[test]
    fn test_read_only_blocks_writes() {
        let file = MemFile::new();
        {
            let (store, _, _ckp) =
                Store::load(file.clone(), small_options()).expect("load");
            store.commit(b"data").expect("commit");
        }
        let (store, entry, _ckp) =
            Store::load(file, small_options().read_only(true)).expect("ro load");
        assert_eq!(entry, b"data");
        assert!(matches!(store.allocate(), Err(Error::ReadOnly)));
        assert!(matches!(store.commit(b"x"), Err(Error::ReadOnly)));
        assert!(matches!(store.rollback(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_retained_checkpoints_replay() {
        let file = MemFile::new();
        let options = small_options().retain_checkpoints(2);
        {
            let (store, _, _ckp) =
                Store::load(file.clone(), options.clone()).expect("load");
            for i in 0..5u8 {
                store.commit(&[i]).expect("commit");
            }
        }
        let (store, entry, _ckp) = Store::load(file, options).expect("reload");
        assert_eq!(entry, vec![4]);
        let st = store.state.lock().unwrap();
        // Two retained histories plus the live tail.
        assert_eq!(st.retained.len(), 3);
    }

    #[test]
    fn test_unknown_magic() {
        let file = MemFile::new();
        file.set_contents(vec![0xEE; 1024]);
        let err = Store::load(file, small_options()).err().expect("fail");
        assert!(matches!(err, Error::UnknownMagicCode));
    }

    #[test]
    fn test_truncated_file_detected() {
        let file = MemFile::new();
        {
            let (store, _, _ckp) =
                Store::load(file.clone(), small_options()).expect("load");
            for _ in 0..4 {
                let (id, _) = store.allocate().expect("allocate");
                let mut buf = store.allocate_buffer();
                store.write_block(id, &mut buf).expect("write");
                store.recycle_buffer(buf);
            }
            store.commit(b"entry").expect("commit");
        }
        let mut data = file.contents();
        data.truncate(2 * 512);
        file.set_contents(data);
        let err = Store::load(file, small_options()).err().expect("fail");
        assert!(matches!(err, Error::FileTruncated { .. }));
    }

    #[test]
    fn test_close_is_terminal() {
        let (store, _, _ckp, _file) = open_mem(small_options());
        store.close().expect("close");
        assert!(matches!(store.close(), Err(Error::Closed)));
        let mut buf = vec![0u8; 512];
        assert!(matches!(store.read_block(2, &mut buf), Err(Error::Closed)));
        assert!(matches!(store.allocate(), Err(Error::Closed)));
    }
}
