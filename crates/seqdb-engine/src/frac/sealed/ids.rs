//! IDs Section Reader
//!
//! The IDs section stores documents pre-sorted descending by `(MID, RID)` as
//! block triplets: one MID block (delta varints), one RID block (fixed
//! little-endian u64s in v1, delta varints in legacy v0), one positions
//! block (delta varints). Each MID-block header carries the block's minimum
//! id in `ext1`/`ext2`, which lets id lookups prune whole blocks without
//! touching payloads.
//!
//! LID 0 is a stub slot (a copy of the newest id), so `values[lid -
//! block_start]` indexes directly by LID.

use std::sync::{Arc, Mutex};

use seqdb_core::{varint, DocPos, Error, Lid, Mid, Result, Rid, SeqId};
use seqdb_storage::{Cache, IndexReader};

use crate::frac::info::BINARY_DATA_V1;

/// Registry-derived descriptor of the IDs section.
#[derive(Debug, Clone)]
pub struct IdsTable {
    /// Minimum id of each triplet block, descending.
    pub min_block_ids: Vec<SeqId>,
    /// Entry count including the LID-0 stub.
    pub ids_total: u32,
    pub id_blocks_total: u32,
    /// Index of the first MID block in the file.
    pub start_block_index: u32,
    pub ids_per_block: u32,
}

impl IdsTable {
    pub fn block_of_lid(&self, lid: Lid) -> u32 {
        lid / self.ids_per_block
    }

    pub fn block_start_lid(&self, block: u32) -> u32 {
        block * self.ids_per_block
    }

    /// Documents stored (stub excluded).
    pub fn docs_total(&self) -> u32 {
        self.ids_total.saturating_sub(1)
    }

    fn mid_block_index(&self, block: u32) -> u32 {
        self.start_block_index + block * 3
    }

    fn rid_block_index(&self, block: u32) -> u32 {
        self.start_block_index + block * 3 + 1
    }

    fn pos_block_index(&self, block: u32) -> u32 {
        self.start_block_index + block * 3 + 2
    }
}

/// Single-entry memo in front of the shared block cache: id lookups walk
/// LIDs sequentially, so the previous block answers most calls.
#[derive(Default)]
struct BlockMemo {
    last: Mutex<Option<(u32, Arc<Vec<u64>>)>>,
}

impl BlockMemo {
    fn get(
        &self,
        block: u32,
        load: impl FnOnce() -> Result<Arc<Vec<u64>>>,
    ) -> Result<Arc<Vec<u64>>> {
        let mut last = self.last.lock().unwrap();
        if let Some((cached_block, values)) = last.as_ref() {
            if *cached_block == block {
                return Ok(values.clone());
            }
        }
        let values = load()?;
        *last = Some((block, values.clone()));
        Ok(values)
    }
}

/// Cached access to MIDs, RIDs and document positions by LID.
pub struct IdsProvider {
    table: Arc<IdsTable>,
    reader: Arc<IndexReader>,
    binary_data_ver: u32,
    mids_cache: Cache<Arc<Vec<u64>>>,
    rids_cache: Cache<Arc<Vec<u64>>>,
    params_cache: Cache<Arc<Vec<u64>>>,
    mid_memo: BlockMemo,
    rid_memo: BlockMemo,
    pos_memo: BlockMemo,
}

impl IdsProvider {
    pub fn new(
        table: Arc<IdsTable>,
        reader: Arc<IndexReader>,
        binary_data_ver: u32,
        mids_cache: Cache<Arc<Vec<u64>>>,
        rids_cache: Cache<Arc<Vec<u64>>>,
        params_cache: Cache<Arc<Vec<u64>>>,
    ) -> Self {
        IdsProvider {
            table,
            reader,
            binary_data_ver,
            mids_cache,
            rids_cache,
            params_cache,
            mid_memo: BlockMemo::default(),
            rid_memo: BlockMemo::default(),
            pos_memo: BlockMemo::default(),
        }
    }

    pub fn table(&self) -> &IdsTable {
        &self.table
    }

    fn check_lid(&self, lid: Lid) -> Result<()> {
        if lid == 0 || lid >= self.table.ids_total {
            return Err(Error::corrupted(format!(
                "lid {lid} out of range 1..{}",
                self.table.ids_total
            )));
        }
        Ok(())
    }

    fn value_at(&self, values: &[u64], lid: Lid, block: u32) -> Result<u64> {
        let at = (lid - self.table.block_start_lid(block)) as usize;
        values
            .get(at)
            .copied()
            .ok_or_else(|| Error::corrupted(format!("lid {lid} beyond its id block")))
    }

    pub fn mid(&self, lid: Lid) -> Result<Mid> {
        self.check_lid(lid)?;
        let block = self.table.block_of_lid(lid);
        let values = self.mid_memo.get(block, || {
            let reader = &self.reader;
            let file_block = self.table.mid_block_index(block);
            self.mids_cache.get_with(file_block, || {
                let payload = reader.read_block(file_block)?;
                let mut values = Vec::new();
                varint::decode_deltas(&payload, &mut values)?;
                let size = (values.capacity() * 8) as u64;
                Ok((Arc::new(values), size))
            })
        })?;
        self.value_at(&values, lid, block)
    }

    pub fn rid(&self, lid: Lid) -> Result<Rid> {
        self.check_lid(lid)?;
        let block = self.table.block_of_lid(lid);
        let ver = self.binary_data_ver;
        let values = self.rid_memo.get(block, || {
            let reader = &self.reader;
            let file_block = self.table.rid_block_index(block);
            self.rids_cache.get_with(file_block, || {
                let payload = reader.read_block(file_block)?;
                let values = decode_rids(&payload, ver)?;
                let size = (values.capacity() * 8) as u64;
                Ok((Arc::new(values), size))
            })
        })?;
        self.value_at(&values, lid, block)
    }

    pub fn doc_pos(&self, lid: Lid) -> Result<DocPos> {
        self.check_lid(lid)?;
        let block = self.table.block_of_lid(lid);
        let values = self.pos_memo.get(block, || {
            let reader = &self.reader;
            let file_block = self.table.pos_block_index(block);
            self.params_cache.get_with(file_block, || {
                let payload = reader.read_block(file_block)?;
                let mut values = Vec::new();
                varint::decode_deltas(&payload, &mut values)?;
                let size = (values.capacity() * 8) as u64;
                Ok((Arc::new(values), size))
            })
        })?;
        Ok(DocPos(self.value_at(&values, lid, block)?))
    }

    pub fn id(&self, lid: Lid) -> Result<SeqId> {
        Ok(SeqId::new(self.mid(lid)?, self.rid(lid)?))
    }

    /// Is `id(lid) <= id`? Short-circuits through `min_block_ids` so the
    /// common case answers without touching MID/RID payloads.
    pub fn less_or_equal(&self, lid: Lid, id: SeqId) -> Result<bool> {
        if lid >= self.table.ids_total {
            // out of the right border: everything there sorts below
            return Ok(true);
        }

        let block = self.table.block_of_lid(lid) as usize;
        if self.table.min_block_ids[block] > id {
            // the block's minimum already exceeds the probe
            return Ok(false);
        }
        if block > 0 && self.table.min_block_ids[block - 1] <= id {
            // even the previous block's minimum is below the probe, so the
            // whole current block is
            return Ok(true);
        }

        let mid = self.mid(lid)?;
        if mid == id.mid {
            if id.rid == u64::MAX {
                return Ok(true);
            }
            return Ok(self.rid(lid)? <= id.rid);
        }
        Ok(mid < id.mid)
    }

    /// Batch id -> LID resolution; 0 for ids not present. Descending-sorted
    /// batches narrow the search range as they go.
    pub fn find_lids(&self, ids: &[SeqId]) -> Result<Vec<Lid>> {
        let mut result = vec![0 as Lid; ids.len()];
        let docs_total = self.table.docs_total();
        if docs_total == 0 {
            return Ok(result);
        }

        let mut left: u32 = 1;
        let right: u32 = docs_total;

        for (i, &id) in ids.iter().enumerate() {
            if i == 0 || !(id < ids[i - 1]) {
                left = 1;
            }

            // first lid in [left, right] with id(lid) <= id
            let mut lo = left;
            let mut hi = right + 1;
            while lo < hi {
                let mid_lid = (lo + hi) / 2;
                if self.less_or_equal(mid_lid, id)? {
                    hi = mid_lid;
                } else {
                    lo = mid_lid + 1;
                }
            }

            if lo <= right && self.mid(lo)? == id.mid && self.rid(lo)? == id.rid {
                result[i] = lo;
            }
            left = lo.max(1);
        }
        Ok(result)
    }
}

fn decode_rids(payload: &[u8], binary_data_ver: u32) -> Result<Vec<u64>> {
    if binary_data_ver >= BINARY_DATA_V1 {
        if payload.len() % 8 != 0 {
            return Err(Error::corrupted("rid block length not a multiple of 8"));
        }
        Ok(payload
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    } else {
        let mut values = Vec::new();
        varint::decode_deltas(payload, &mut values)?;
        Ok(values)
    }
}
