//! Token Blocks and the Token Table
//!
//! The tokens section stores every token value of the fraction, field by
//! field in ascending field order, values sorted within each field. A token
//! is serialized as `u32 len || value`; each producer chunk is terminated by
//! a `0xFFFFFFFF` sentinel the decoder skips.
//!
//! The token table maps each field to the `TableEntry` runs describing which
//! physical token block holds which TID range. `min_val` is persisted only
//! for the first entry of a block; the in-memory table keeps the field-wide
//! minimum instead, mirroring how it is consumed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use seqdb_core::query::Term;
use seqdb_core::varint::Decoder;
use seqdb_core::{Error, Result, Tid};
use seqdb_storage::{Cache, IndexReader};

use crate::pattern;

const TOKEN_SENTINEL: u32 = u32::MAX;

/// Cache key of the assembled token table.
pub const CACHE_KEY_TABLE: u32 = 1;

/// Decoded token block: raw payload plus per-token offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBlock {
    payload: Vec<u8>,
    offsets: Vec<u32>,
}

impl TokenBlock {
    /// Append one token to a block under construction.
    pub fn push_token(buf: &mut BytesMut, value: &[u8]) {
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }

    /// Terminate a producer chunk.
    pub fn push_sentinel(buf: &mut BytesMut) {
        buf.put_u32_le(TOKEN_SENTINEL);
    }

    pub fn unpack(payload: Vec<u8>) -> Result<TokenBlock> {
        let mut offsets = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= payload.len() {
            let len = u32::from_le_bytes([
                payload[offset],
                payload[offset + 1],
                payload[offset + 2],
                payload[offset + 3],
            ]);
            if len == TOKEN_SENTINEL {
                offset += 4;
                continue;
            }
            if offset + 4 + len as usize > payload.len() {
                return Err(Error::corrupted(format!(
                    "token length {len} overruns block at offset {offset}"
                )));
            }
            offsets.push(offset as u32);
            offset += 4 + len as usize;
        }
        if offset != payload.len() {
            return Err(Error::corrupted("trailing bytes in token block"));
        }
        Ok(TokenBlock { payload, offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn token(&self, index: usize) -> Result<&[u8]> {
        let &offset = self
            .offsets
            .get(index)
            .ok_or_else(|| Error::corrupted("token index out of block range"))?;
        let offset = offset as usize;
        let len = u32::from_le_bytes([
            self.payload[offset],
            self.payload[offset + 1],
            self.payload[offset + 2],
            self.payload[offset + 3],
        ]) as usize;
        Ok(&self.payload[offset + 4..offset + 4 + len])
    }

    pub fn size_bytes(&self) -> u64 {
        (self.payload.capacity() + self.offsets.capacity() * 4 + 48) as u64
    }
}

/// One contiguous run of a field's tokens covered by a single token block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// Tokens preceding this run inside its physical block.
    pub start_index: u32,
    pub start_tid: Tid,
    pub val_count: u32,
    /// Physical block index in the index file.
    pub block_index: u32,
    /// Persisted only for the first entry of a block.
    pub min_val: Vec<u8>,
    pub max_val: Vec<u8>,
}

impl TableEntry {
    pub fn last_tid(&self) -> Tid {
        self.start_tid + self.val_count - 1
    }

    pub fn contains_tid(&self, tid: Tid) -> bool {
        self.start_tid <= tid && tid <= self.last_tid()
    }

    pub fn index_in_block(&self, tid: Tid) -> usize {
        (self.start_index + tid - self.start_tid) as usize
    }

    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.start_tid);
        buf.put_u32_le(self.val_count);
        buf.put_u32_le(self.start_index);
        buf.put_u32_le(self.block_index);
        buf.put_u32_le(self.min_val.len() as u32);
        buf.put_slice(&self.min_val);
        buf.put_u32_le(self.max_val.len() as u32);
        buf.put_slice(&self.max_val);
    }
}

/// One token-table block: a field name plus its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBlock {
    pub field: Vec<u8>,
    pub entries: Vec<TableEntry>,
}

impl TableBlock {
    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.field.len() as u32);
        buf.put_slice(&self.field);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            entry.pack(buf);
        }
    }

    pub fn unpack_all(payload: &[u8]) -> Result<Vec<TableBlock>> {
        let mut dec = Decoder::new(payload);
        let mut blocks = Vec::new();
        while !dec.is_empty() {
            let field = dec.get_binary()?.to_vec();
            let count = dec.get_u32_le()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let start_tid = dec.get_u32_le()?;
                let val_count = dec.get_u32_le()?;
                let start_index = dec.get_u32_le()?;
                let block_index = dec.get_u32_le()?;
                let min_val = dec.get_binary()?.to_vec();
                let max_val = dec.get_binary()?.to_vec();
                entries.push(TableEntry {
                    start_index,
                    start_tid,
                    val_count,
                    block_index,
                    min_val,
                    max_val,
                });
            }
            blocks.push(TableBlock { field, entries });
        }
        Ok(blocks)
    }
}

/// Per-field catalog of token runs.
#[derive(Debug, Default, Clone)]
pub struct TokenTable {
    pub fields: HashMap<Vec<u8>, FieldData>,
}

#[derive(Debug, Clone)]
pub struct FieldData {
    pub min_val: Vec<u8>,
    pub entries: Vec<TableEntry>,
}

impl TokenTable {
    pub fn from_blocks(blocks: Vec<TableBlock>) -> TokenTable {
        let mut fields: HashMap<Vec<u8>, FieldData> = HashMap::new();
        for block in blocks {
            let data = fields.entry(block.field).or_insert_with(|| FieldData {
                min_val: Vec::new(),
                entries: Vec::new(),
            });
            for mut entry in block.entries {
                if data.entries.is_empty() && !entry.min_val.is_empty() {
                    data.min_val = std::mem::take(&mut entry.min_val);
                } else {
                    entry.min_val.clear();
                }
                data.entries.push(entry);
            }
        }
        TokenTable { fields }
    }

    pub fn size_bytes(&self) -> u64 {
        let mut size = 64u64;
        for (field, data) in &self.fields {
            size += field.len() as u64 + 32;
            for entry in &data.entries {
                size += 24 + entry.max_val.len() as u64 + entry.min_val.len() as u64;
            }
        }
        size
    }

    /// Entry holding `tid`, if any.
    pub fn entry_by_tid(&self, tid: Tid) -> Option<&TableEntry> {
        for data in self.fields.values() {
            if data.entries.is_empty() {
                continue;
            }
            let first = data.entries[0].start_tid;
            let last = data.entries[data.entries.len() - 1].last_tid();
            if tid < first || tid > last {
                continue;
            }
            let at = data
                .entries
                .partition_point(|e| e.last_tid() < tid);
            if at < data.entries.len() && data.entries[at].contains_tid(tid) {
                return Some(&data.entries[at]);
            }
        }
        None
    }

    /// Entries of `field` whose `[min, max_val]` value range may hold a
    /// match for `term`. Unanchored terms keep every entry.
    pub fn select_entries(&self, field: &[u8], term: &Term) -> Vec<TableEntry> {
        let Some(data) = self.fields.get(field) else {
            return Vec::new();
        };

        let lower: Option<Vec<u8>> = match term {
            Term::Literal(v) => Some(v.to_ascii_lowercase().into_bytes()),
            Term::Wildcard(w) => w.prefix().map(|p| p.to_ascii_lowercase().into_bytes()),
            // numeric order disagrees with the entries' lexicographic ranges
            Term::Range(r) if r.is_numeric() => None,
            Term::Range(r) => Some(r.from.as_deref().unwrap_or("").as_bytes().to_vec()),
            Term::IpRange { .. } => None,
        };

        let Some(lower) = lower else {
            return data.entries.clone();
        };

        // keep entries whose max_val can still reach the lower bound; the
        // per-token predicate re-checks everything afterwards
        data.entries
            .iter()
            .filter(|e| e.max_val.as_slice() >= lower.as_slice())
            .cloned()
            .collect()
    }
}

/// Reads and caches decoded token blocks.
pub struct TokenBlockLoader {
    reader: Arc<IndexReader>,
    cache: Cache<Arc<TokenBlock>>,
}

impl TokenBlockLoader {
    pub fn new(reader: Arc<IndexReader>, cache: Cache<Arc<TokenBlock>>) -> Self {
        TokenBlockLoader { reader, cache }
    }

    pub fn block(&self, block_index: u32) -> Result<Arc<TokenBlock>> {
        self.cache.get_with(block_index, || {
            let payload = self.reader.read_block(block_index)?;
            let block = TokenBlock::unpack(payload)?;
            let size = block.size_bytes();
            Ok((Arc::new(block), size))
        })
    }
}

/// Loads the whole token table (cached as one entry).
pub struct TokenTableLoader {
    reader: Arc<IndexReader>,
    cache: Cache<Arc<TokenTable>>,
    /// First block of the token-table section.
    section_start: u32,
}

impl TokenTableLoader {
    pub fn new(reader: Arc<IndexReader>, cache: Cache<Arc<TokenTable>>, section_start: u32) -> Self {
        TokenTableLoader {
            reader,
            cache,
            section_start,
        }
    }

    pub fn load(&self) -> Result<Arc<TokenTable>> {
        self.cache.get_with(CACHE_KEY_TABLE, || {
            let mut blocks = Vec::new();
            let registry = self.reader.registry()?;
            let mut index = self.section_start;
            while !registry.is_empty_block(index)? {
                let payload = self.reader.read_block(index)?;
                blocks.extend(TableBlock::unpack_all(&payload)?);
                index += 1;
            }
            let table = TokenTable::from_blocks(blocks);
            let size = table.size_bytes();
            Ok((Arc::new(table), size))
        })
    }
}

/// Ordered token provider over the selected entries of one field.
pub struct SealedTokenProvider<'a> {
    loader: &'a TokenBlockLoader,
    entries: Vec<TableEntry>,
    /// Position of the first token of each entry, plus the total.
    cumulative: Vec<usize>,
}

impl<'a> SealedTokenProvider<'a> {
    pub fn new(loader: &'a TokenBlockLoader, entries: Vec<TableEntry>) -> Self {
        let mut cumulative = Vec::with_capacity(entries.len() + 1);
        let mut total = 0usize;
        for entry in &entries {
            cumulative.push(total);
            total += entry.val_count as usize;
        }
        cumulative.push(total);
        SealedTokenProvider {
            loader,
            entries,
            cumulative,
        }
    }

    fn locate(&self, pos: usize) -> (&TableEntry, usize) {
        let at = self.cumulative.partition_point(|&c| c <= pos) - 1;
        (&self.entries[at], pos - self.cumulative[at])
    }
}

impl pattern::TokenProvider for SealedTokenProvider<'_> {
    fn count(&self) -> usize {
        *self.cumulative.last().unwrap_or(&0)
    }

    fn token_at(&self, pos: usize) -> Result<Vec<u8>> {
        let (entry, within) = self.locate(pos);
        let block = self.loader.block(entry.block_index)?;
        Ok(block
            .token(entry.start_index as usize + within)?
            .to_vec())
    }

    fn tid_at(&self, pos: usize) -> Tid {
        let (entry, within) = self.locate(pos);
        entry.start_tid + within as u32
    }

    fn ordered(&self) -> bool {
        true
    }
}
