//! Sealed Fraction Loader
//!
//! Walks the index-file registry once to find section boundaries (the empty
//! separator blocks) and builds the in-memory tables without reading any
//! payload except the positions block:
//!
//! ```text
//! [info] [tokens]…[] [token_table]…[] [positions] [id_triplets]…[] [lids]…[] [registry]
//! ```
//!
//! The extension words recorded in the registry carry everything else: the
//! minimum id of each MID block, and `(max_tid << 32) | min_tid` plus the
//! continuation flag of each LID block.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use seqdb_core::{varint, Error, Result, SeqId};
use seqdb_storage::IndexReader;

use super::ids::IdsTable;
use super::lids::LidsTable;

/// Decoded positions block: the docs-file offset of every docs block, plus
/// the total id count (stub included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOffsets {
    pub ids_total: u32,
    pub offsets: Vec<u64>,
}

impl BlockOffsets {
    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.offsets.len() as u32);
        buf.put_u32_le(self.ids_total);
        varint::encode_deltas(buf, &self.offsets);
    }

    pub fn unpack(payload: &[u8]) -> Result<BlockOffsets> {
        let mut dec = varint::Decoder::new(payload);
        let count = dec.get_u32_le()?;
        let ids_total = dec.get_u32_le()?;

        let mut offsets = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        while !dec.is_empty() {
            let delta = dec.get_varint_i64()?;
            offset = offset.wrapping_add(delta as u64);
            offsets.push(offset);
        }
        if offsets.len() != count as usize {
            return Err(Error::corrupted(format!(
                "positions block declares {count} offsets, found {}",
                offsets.len()
            )));
        }
        Ok(BlockOffsets { ids_total, offsets })
    }
}

/// Tables built by one loader pass.
pub struct SealedState {
    pub ids_table: Arc<IdsTable>,
    pub lids_table: Arc<LidsTable>,
    pub blocks_offsets: Arc<Vec<u64>>,
    /// First block of the token-table section (for the table loader).
    pub token_table_start: u32,
}

/// Scan the registry and build the sealed fraction's tables.
pub fn load(reader: &IndexReader, ids_per_block: u32) -> Result<SealedState> {
    let registry = reader.registry()?;
    let total = registry.len() as u32;

    let expect_more = |index: u32| -> Result<()> {
        if index >= total {
            return Err(Error::corrupted(format!(
                "{}: index file truncated: no section separator before block {index}",
                reader.file_name()
            )));
        }
        Ok(())
    };

    // block 0 is the info block
    let mut index = 1u32;

    // tokens section
    loop {
        expect_more(index)?;
        if registry.is_empty_block(index)? {
            index += 1;
            break;
        }
        index += 1;
    }

    let token_table_start = index;
    loop {
        expect_more(index)?;
        if registry.is_empty_block(index)? {
            index += 1;
            break;
        }
        index += 1;
    }

    // positions block
    expect_more(index)?;
    let positions = BlockOffsets::unpack(&reader.read_block(index)?)?;
    index += 1;

    // id triplets: min ids come from the MID-block registry entries
    let ids_start = index;
    let mut min_block_ids: Vec<SeqId> = Vec::new();
    loop {
        expect_more(index)?;
        if registry.is_empty_block(index)? {
            index += 1;
            break;
        }
        let (ext1, ext2) = registry.exts(index)?;
        min_block_ids.push(SeqId::new(ext1, ext2));
        // skip the RID and positions blocks of the triplet
        expect_more(index + 2)?;
        index += 3;
    }

    // lids section
    let lids_start = index;
    let mut min_tids = Vec::new();
    let mut max_tids = Vec::new();
    let mut is_continued = Vec::new();
    loop {
        expect_more(index)?;
        if registry.is_empty_block(index)? {
            index += 1;
            break;
        }
        let (ext1, ext2) = registry.exts(index)?;
        min_tids.push((ext2 & 0xFFFF_FFFF) as u32);
        max_tids.push((ext2 >> 32) as u32);
        is_continued.push(ext1 == 1);
        index += 1;
    }

    let ids_table = Arc::new(IdsTable {
        id_blocks_total: min_block_ids.len() as u32,
        min_block_ids,
        ids_total: positions.ids_total,
        start_block_index: ids_start,
        ids_per_block,
    });
    let lids_table = Arc::new(LidsTable {
        start_block_index: lids_start,
        min_tids,
        max_tids,
        is_continued,
    });

    Ok(SealedState {
        ids_table,
        lids_table,
        blocks_offsets: Arc::new(positions.offsets),
        token_table_start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_offsets_roundtrip() {
        let offsets = BlockOffsets {
            ids_total: 4097,
            offsets: vec![0, 4096, 9000, 100_000],
        };
        let mut buf = BytesMut::new();
        offsets.pack(&mut buf);
        assert_eq!(BlockOffsets::unpack(&buf).unwrap(), offsets);
    }

    #[test]
    fn test_block_offsets_empty() {
        let offsets = BlockOffsets {
            ids_total: 1,
            offsets: vec![],
        };
        let mut buf = BytesMut::new();
        offsets.pack(&mut buf);
        assert_eq!(BlockOffsets::unpack(&buf).unwrap(), offsets);
    }

    #[test]
    fn test_block_offsets_count_mismatch() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(5);
        buf.put_u32_le(10);
        varint::encode_i64(&mut buf, 0);
        assert!(BlockOffsets::unpack(&buf).is_err());
    }

    #[test]
    fn test_block_offsets_truncated() {
        assert!(BlockOffsets::unpack(&[1, 2, 3]).is_err());
    }
}
