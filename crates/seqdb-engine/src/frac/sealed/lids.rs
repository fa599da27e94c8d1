//! LID Blocks
//!
//! The LIDs section of a sealed index stores, for each field in field order
//! and each token in value order, the token's posting list. Lists are packed
//! into blocks of at most `lid_block_cap` LIDs; a list that does not fit
//! spills into the next block, which is then marked *continued*.
//!
//! On disk a block is a run of zigzag varints: LID deltas within a list,
//! with `-1 - last_lid` as the end-of-list marker between lists (and after
//! the final list only when it does not spill). The block header carries
//! `ext1 = continued flag` and `ext2 = (max_tid << 32) | min_tid`, where a
//! continued block keeps the historical `min_tid = prev_max_tid + 1`
//! convention: the LIDs before its first end marker belong to `min_tid - 1`.

use std::sync::Arc;

use bytes::BytesMut;

use seqdb_core::varint;
use seqdb_core::{Error, Lid, Result, Tid};
use seqdb_storage::{Cache, IndexReader};

/// Decoded LID block: concatenated posting segments with their boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LidsBlock {
    pub lids: Vec<Lid>,
    /// Segment boundaries: segment `i` spans `lids[offsets[i]..offsets[i+1]]`.
    pub offsets: Vec<u32>,
    /// The last segment ends inside this block (no spill into the next one).
    pub is_last_lid: bool,
}

impl LidsBlock {
    pub fn segments(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn segment(&self, i: usize) -> &[Lid] {
        &self.lids[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    pub fn size_bytes(&self) -> u64 {
        ((self.lids.capacity() + self.offsets.capacity()) * 4 + 24) as u64
    }

    /// Pack segments as delta varints with end-of-list markers. The delta
    /// accumulator runs across segment boundaries within the block.
    pub fn pack(&self, buf: &mut BytesMut) {
        let mut last: i64 = 0;
        let segment_count = self.segments();
        for i in 0..segment_count {
            for &lid in self.segment(i) {
                varint::encode_i64(buf, lid as i64 - last);
                last = lid as i64;
            }
            if i + 1 < segment_count || self.is_last_lid {
                // adding this delta to `last` lands on -1 (u32::MAX), the
                // end-of-list marker
                varint::encode_i64(buf, -1 - last);
            }
        }
    }

    pub fn unpack(mut data: &[u8]) -> Result<LidsBlock> {
        let mut lids: Vec<Lid> = Vec::new();
        let mut offsets: Vec<u32> = vec![0];
        let mut lid: u32 = 0;
        let mut closed_at = 0u32;

        while !data.is_empty() {
            let (delta, n) = varint::decode_i64(data)?;
            data = &data[n..];
            let next = lid.wrapping_add(delta as u32);

            if next == u32::MAX {
                // end of the current token's list
                closed_at = lids.len() as u32;
                offsets.push(closed_at);
                continue;
            }
            lid = next;
            lids.push(lid);
        }

        let is_last_lid = (closed_at as usize) >= lids.len();
        if !is_last_lid {
            offsets.push(lids.len() as u32);
        }

        Ok(LidsBlock {
            lids,
            offsets,
            is_last_lid,
        })
    }
}

/// Header-derived descriptor table of the LIDs section.
pub struct LidsTable {
    pub start_block_index: u32,
    pub min_tids: Vec<Tid>,
    pub max_tids: Vec<Tid>,
    pub is_continued: Vec<bool>,
}

impl LidsTable {
    pub fn blocks(&self) -> usize {
        self.min_tids.len()
    }

    /// Does local block `b` hold LIDs of `tid` (own range or continuation)?
    fn block_has_tid(&self, b: usize, tid: Tid) -> bool {
        (self.min_tids[b] <= tid && tid <= self.max_tids[b])
            || (self.is_continued[b] && self.min_tids[b] == tid + 1)
    }

    /// First local block containing `tid`, if any.
    pub fn first_block_for_tid(&self, tid: Tid) -> Option<usize> {
        // max_tids is non-decreasing
        let mut lo = 0usize;
        let mut hi = self.blocks();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.max_tids[mid] < tid {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.blocks() && self.block_has_tid(lo, tid) {
            Some(lo)
        } else {
            None
        }
    }

    /// Last local block containing `tid`, if any.
    pub fn last_block_for_tid(&self, tid: Tid) -> Option<usize> {
        // find the last block with min_tid <= tid + 1 (continuations carry
        // min_tid = tid + 1)
        let mut lo = 0usize;
        let mut hi = self.blocks();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.min_tids[mid] <= tid.saturating_add(1) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let mut b = lo;
        while b > 0 {
            b -= 1;
            if self.block_has_tid(b, tid) {
                return Some(b);
            }
            if self.min_tids[b] <= tid {
                break;
            }
        }
        None
    }

    /// Segment index of `tid` within local block `b`, for a tid in the
    /// block's own `[min_tid, max_tid]` range (the continuation head is
    /// always segment 0 and is resolved by the caller).
    fn segment_of(&self, b: usize, tid: Tid) -> usize {
        let base = if self.is_continued[b] { 1 } else { 0 };
        base + (tid - self.min_tids[b]) as usize
    }
}

/// Reads, decodes and caches LID blocks.
pub struct LidsLoader {
    reader: Arc<IndexReader>,
    cache: Cache<Arc<LidsBlock>>,
    table_start: u32,
}

impl LidsLoader {
    pub fn new(reader: Arc<IndexReader>, cache: Cache<Arc<LidsBlock>>, table_start: u32) -> Self {
        LidsLoader {
            reader,
            cache,
            table_start,
        }
    }

    /// Load the local block `b` (relative to the section start).
    pub fn block(&self, b: usize) -> Result<Arc<LidsBlock>> {
        let index = self.table_start + b as u32;
        self.cache.get_with(index, || {
            let payload = self.reader.read_block(index)?;
            let block = LidsBlock::unpack(&payload)?;
            let size = block.size_bytes();
            Ok((Arc::new(block), size))
        })
    }
}

/// Iterator over one token's posting list, bounded by `[min_lid, max_lid]`.
/// Walks continued blocks transparently; yields strictly monotone LIDs.
pub struct LidsCursor<'a> {
    table: &'a LidsTable,
    loader: &'a LidsLoader,
    tid: Tid,
    reverse: bool,
    min_lid: Lid,
    max_lid: Lid,
    /// (local block, segment, position within segment)
    state: Option<(usize, usize, usize)>,
    block: Option<Arc<LidsBlock>>,
    done: bool,
}

impl<'a> LidsCursor<'a> {
    pub fn new(
        table: &'a LidsTable,
        loader: &'a LidsLoader,
        tid: Tid,
        min_lid: Lid,
        max_lid: Lid,
        reverse: bool,
    ) -> Self {
        LidsCursor {
            table,
            loader,
            tid,
            reverse,
            min_lid,
            max_lid,
            state: None,
            block: None,
            done: false,
        }
    }

    fn prime(&mut self) -> Result<()> {
        let first = if self.reverse {
            self.table.last_block_for_tid(self.tid)
        } else {
            self.table.first_block_for_tid(self.tid)
        };
        let Some(b) = first else {
            self.done = true;
            return Ok(());
        };

        let block = self.loader.block(b)?;
        let seg = if self.table.is_continued[b] && self.table.min_tids[b] == self.tid + 1 {
            0
        } else {
            self.table.segment_of(b, self.tid)
        };
        if seg >= block.segments() {
            return Err(Error::corrupted(format!(
                "lids table inconsistent: block {b} has {} segments, need {seg}",
                block.segments()
            )));
        }
        let pos = if self.reverse {
            block.segment(seg).len()
        } else {
            0
        };
        self.state = Some((b, seg, pos));
        self.block = Some(block);
        Ok(())
    }

    /// Move to the adjacent block holding the same token's spill, if any.
    fn advance_block(&mut self) -> Result<bool> {
        let (b, seg, _) = self.state.unwrap();
        let block = self.block.as_ref().unwrap();

        if self.reverse {
            // earlier part exists when this segment is the continuation head
            if seg == 0 && self.table.is_continued[b] && b > 0 {
                let prev = self.loader.block(b - 1)?;
                let last_seg = prev.segments() - 1;
                let pos = prev.segment(last_seg).len();
                self.state = Some((b - 1, last_seg, pos));
                self.block = Some(prev);
                return Ok(true);
            }
        } else {
            // later part exists when this is the last, unterminated segment
            let last_seg = block.segments() - 1;
            if seg == last_seg && !block.is_last_lid && b + 1 < self.table.blocks() {
                let next = self.loader.block(b + 1)?;
                self.state = Some((b + 1, 0, 0));
                self.block = Some(next);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl crate::search::LidIter for LidsCursor<'_> {
    fn next(&mut self) -> Result<Option<Lid>> {
        if self.done {
            return Ok(None);
        }
        if self.state.is_none() {
            self.prime()?;
            if self.done {
                return Ok(None);
            }
        }

        loop {
            let (b, seg, pos) = self.state.unwrap();
            let block = self.block.as_ref().unwrap();
            let segment = block.segment(seg);

            let lid = if self.reverse {
                if pos == 0 {
                    if !self.advance_block()? {
                        self.done = true;
                        return Ok(None);
                    }
                    continue;
                }
                let lid = segment[pos - 1];
                self.state = Some((b, seg, pos - 1));
                lid
            } else {
                if pos >= segment.len() {
                    if !self.advance_block()? {
                        self.done = true;
                        return Ok(None);
                    }
                    continue;
                }
                let lid = segment[pos];
                self.state = Some((b, seg, pos + 1));
                lid
            };

            // posting lists ascend, so one bound ends the stream early
            if self.reverse {
                if lid < self.min_lid {
                    self.done = true;
                    return Ok(None);
                }
                if lid > self.max_lid {
                    continue;
                }
            } else {
                if lid > self.max_lid {
                    self.done = true;
                    return Ok(None);
                }
                if lid < self.min_lid {
                    continue;
                }
            }
            return Ok(Some(lid));
        }
    }
}
