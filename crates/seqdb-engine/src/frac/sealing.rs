//! Sealing
//!
//! A single deterministic pass that turns a frozen active fraction into the
//! sealed on-disk layout:
//!
//! 1. **Info block**: JSON fraction info behind the `SEQM` magic.
//! 2. **Tokens**: per field (ascending field order), token values sorted,
//!    re-assigning TIDs so value order equals TID order; fields larger than
//!    one block start on a fresh block boundary. Trailing empty block.
//! 3. **Token table**: the `TableEntry` runs collected while writing the
//!    tokens. Trailing empty block.
//! 4. **Positions block**: docs-block offsets + total id count.
//! 5. **IDs**: documents sorted `(MID, RID)`-descending (finalizing LIDs),
//!    written as MID/RID/pos block triplets of `ids_per_block` entries; each
//!    MID-block header carries the block's minimum id. Trailing empty block.
//! 6. **LIDs**: per field, per token, the posting list remapped to final
//!    LIDs; blocks capped at `lid_block_cap` entries, spills marked
//!    continued. Trailing empty block.
//! 7. **Registry**.
//!
//! The index is written to `<base>._index` and renamed into place, so a
//! crash mid-seal leaves only a tmp file that startup recovery unlinks. The
//! `.meta` file is removed once the index is durable.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use seqdb_core::{varint, Error, Lid, Result, SeqId, Tid};
use seqdb_storage::writer::{BlockFormer, BlockStats, FlushOptions, SealingStats};
use seqdb_storage::{BlocksWriter, ReadLimiter};

use super::active::Active;
use super::info::{now_ms, BINARY_DATA_V1};
use super::sealed::loader::BlockOffsets;
use super::sealed::token::{TableBlock, TableEntry, TokenBlock, TokenTable};
use super::sealed::Sealed;
use super::{
    remove_file_if_exists, sync_parent_dir, INDEX_SUFFIX, INDEX_TMP_SUFFIX, META_SUFFIX,
};
use crate::config::{IDS_PER_BLOCK, LID_BLOCK_CAP, REGULAR_BLOCK_SIZE, SealParams};

/// Seal `active` into an immutable fraction. The caller must have stopped
/// appends and drained the indexer; an empty fraction is the caller's
/// problem (it is suicided, not sealed).
pub fn seal(
    active: &Active,
    params: &SealParams,
    limiter: Arc<ReadLimiter>,
) -> Result<Arc<Sealed>> {
    let started = std::time::Instant::now();
    if active.is_suicided() {
        return Err(Error::Suicided);
    }

    let snapshot = active.index_snapshot();
    let docs_total = snapshot.docs_total();
    if docs_total == 0 {
        return Err(Error::InvalidArgument(
            "cannot seal an empty fraction".to_string(),
        ));
    }

    // finalize LIDs: stable sort descending by (MID, RID)
    let ids = snapshot.ids();
    let mut order: Vec<Lid> = (1..=docs_total).collect();
    order.sort_by(|&a, &b| ids[b as usize - 1].cmp(&ids[a as usize - 1]));

    let mut sorted_ids: Vec<SeqId> = Vec::with_capacity(docs_total as usize + 1);
    // LID 0 stub repeats the newest id, keeping every block descending
    sorted_ids.push(ids[order[0] as usize - 1]);
    let mut old_to_new: Vec<Lid> = vec![0; docs_total as usize + 1];
    for (at, &old) in order.iter().enumerate() {
        sorted_ids.push(ids[old as usize - 1]);
        old_to_new[old as usize] = at as Lid + 1;
    }

    let positions = snapshot.positions();
    let sorted_pos: Vec<u64> = {
        let mut pos = Vec::with_capacity(sorted_ids.len());
        pos.push(positions[order[0] as usize - 1].0);
        pos.extend(order.iter().map(|&old| positions[old as usize - 1].0));
        pos
    };

    // fields in ascending order; tokens within a field in value order
    let mut fields: Vec<&[u8]> = snapshot.field_tids().keys().map(Vec::as_slice).collect();
    fields.sort_unstable();
    let tokens = snapshot.tokens();
    let sorted_tids: Vec<(usize, Vec<Tid>)> = fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let mut tids = snapshot.field_tids()[*field].clone();
            tids.sort_by(|&a, &b| {
                tokens[a as usize - 1].value.cmp(&tokens[b as usize - 1].value)
            });
            (i, tids)
        })
        .collect();

    let mut info = active.info();
    info.binary_data_ver = BINARY_DATA_V1;
    info.sealing_time = now_ms();
    info.docs_total = docs_total;
    info.build_distribution(&sorted_ids[1..]);

    let tmp_path = suffixed(active.base_path(), INDEX_TMP_SUFFIX);
    let index_path = suffixed(active.base_path(), INDEX_SUFFIX);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BlocksWriter::new(file)?;
    let mut stats: SealingStats = Vec::new();

    // 1. info
    let info_payload = info.pack();
    let info_written = writer.write_block(&info_payload, false, 0, 0, 0)?;
    stats.push(BlockStats {
        name: "info",
        raw: info_payload.len() as u64,
        comp: info_written,
        blocks: 1,
        ..Default::default()
    });

    // 2-3. tokens + token table
    let table = write_tokens(
        &mut writer,
        &mut stats,
        params,
        &fields,
        &sorted_tids,
        tokens,
    )?;
    write_token_table(&mut writer, &mut stats, params, &table)?;

    // 4. positions
    let offsets_block = BlockOffsets {
        ids_total: sorted_ids.len() as u32,
        offsets: snapshot.blocks_offsets().to_vec(),
    };
    let mut buf = BytesMut::with_capacity(crate::config::IDS_BLOCK_SIZE);
    offsets_block.pack(&mut buf);
    let written = writer.write_block(&buf, true, params.ids_zstd_level, 0, 0)?;
    stats.push(BlockStats {
        name: "positions",
        raw: buf.len() as u64,
        comp: written,
        blocks: 1,
        ..Default::default()
    });

    // 5. id triplets
    write_ids(&mut writer, &mut stats, params, &sorted_ids, &sorted_pos)?;

    // 6. lids
    write_lids(
        &mut writer,
        &mut stats,
        params,
        &sorted_tids,
        snapshot.postings(),
        &old_to_new,
    )?;

    // 7. registry
    writer.write_registry()?;
    let file = writer.into_inner();
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, &index_path)?;
    sync_parent_dir(&index_path)?;
    remove_file_if_exists(&suffixed(active.base_path(), META_SUFFIX))?;
    drop(snapshot);

    info.index_on_disk = std::fs::metadata(&index_path)?.len();
    info.meta_on_disk = 0;

    for section in &stats {
        tracing::debug!(
            section = section.name,
            raw = section.raw,
            comp = section.comp,
            blocks = section.blocks,
            "sealed section"
        );
    }
    tracing::info!(
        fraction = %info.name(),
        docs_total,
        index_on_disk = info.index_on_disk,
        took_ms = started.elapsed().as_millis() as u64,
        "fraction sealed"
    );

    let token_table = Arc::new(TokenTable::from_blocks(table));
    let sealed = Sealed::open(
        active.base_path(),
        limiter,
        active.caches().clone(),
        Some(info),
    )?;
    sealed.seed_token_table(token_table);
    Ok(sealed)
}

fn write_tokens<W: std::io::Write + std::io::Seek>(
    writer: &mut BlocksWriter<W>,
    stats: &mut SealingStats,
    params: &SealParams,
    fields: &[&[u8]],
    sorted_tids: &[(usize, Vec<Tid>)],
    tokens: &[seqdb_core::Token],
) -> Result<Vec<TableBlock>> {
    let opts = FlushOptions::level(params.tokens_zstd_level);
    let mut former = BlockFormer::new("tokens", writer, REGULAR_BLOCK_SIZE);

    let mut table: Vec<TableBlock> = Vec::with_capacity(fields.len());
    let mut next_tid: Tid = 1;
    let mut start_index: u32 = 0;

    for (field_at, tids) in sorted_tids {
        let field = fields[*field_at];
        let field_size: usize = tids
            .iter()
            .map(|&tid| 4 + tokens[tid as usize - 1].value.len())
            .sum();
        // split large fields across blocks of even token counts
        let blocks_count = field_size / REGULAR_BLOCK_SIZE + 1;
        let chunk_len = (tids.len() / blocks_count).max(1);

        let mut entries: Vec<TableEntry> = Vec::new();
        for chunk in tids.chunks(chunk_len) {
            if entries.is_empty() && field_size > REGULAR_BLOCK_SIZE {
                // a big field starts on a fresh block boundary
                former.flush_forced(opts)?;
                start_index = 0;
            }

            let first_val = &tokens[chunk[0] as usize - 1].value;
            let last_val = &tokens[chunk[chunk.len() - 1] as usize - 1].value;
            entries.push(TableEntry {
                start_index,
                start_tid: next_tid,
                val_count: chunk.len() as u32,
                block_index: former.block_index(),
                min_val: if entries.is_empty() {
                    first_val.clone()
                } else {
                    Vec::new()
                },
                max_val: last_val.clone(),
            });

            for &tid in chunk {
                TokenBlock::push_token(&mut former.buf, &tokens[tid as usize - 1].value);
            }
            TokenBlock::push_sentinel(&mut former.buf);
            start_index += chunk.len() as u32;
            next_tid += chunk.len() as u32;

            if former.flush_if_needed(opts)? {
                start_index = 0;
            }
        }
        table.push(TableBlock {
            field: field.to_vec(),
            entries,
        });
    }

    former.flush_forced(opts)?;
    stats.push(former.finish());
    writer.write_empty_block()?;
    Ok(table)
}

fn write_token_table<W: std::io::Write + std::io::Seek>(
    writer: &mut BlocksWriter<W>,
    stats: &mut SealingStats,
    params: &SealParams,
    table: &[TableBlock],
) -> Result<()> {
    let opts = FlushOptions::level(params.token_table_zstd_level);
    let mut former = BlockFormer::new("token_table", writer, REGULAR_BLOCK_SIZE);

    for block in table {
        block.pack(&mut former.buf);
        former.flush_if_needed(opts)?;
    }

    former.flush_forced(opts)?;
    stats.push(former.finish());
    writer.write_empty_block()?;
    Ok(())
}

fn write_ids<W: std::io::Write + std::io::Seek>(
    writer: &mut BlocksWriter<W>,
    stats: &mut SealingStats,
    params: &SealParams,
    sorted_ids: &[SeqId],
    sorted_pos: &[u64],
) -> Result<()> {
    let mut section = BlockStats {
        name: "ids",
        ..Default::default()
    };
    let mut buf = BytesMut::new();

    for (chunk, pos_chunk) in sorted_ids
        .chunks(IDS_PER_BLOCK as usize)
        .zip(sorted_pos.chunks(IDS_PER_BLOCK as usize))
    {
        // ids are descending, so the block minimum is its last entry
        let min_id = chunk[chunk.len() - 1];

        buf.clear();
        let mids: Vec<u64> = chunk.iter().map(|id| id.mid).collect();
        varint::encode_deltas(&mut buf, &mids);
        section.raw += buf.len() as u64;
        section.comp +=
            writer.write_block(&buf, true, params.ids_zstd_level, min_id.mid, min_id.rid)?;

        buf.clear();
        for id in chunk {
            buf.put_u64_le(id.rid);
        }
        section.raw += buf.len() as u64;
        section.comp += writer.write_block(&buf, true, params.ids_zstd_level, 0, 0)?;

        buf.clear();
        varint::encode_deltas(&mut buf, pos_chunk);
        section.raw += buf.len() as u64;
        section.comp += writer.write_block(&buf, true, params.ids_zstd_level, 0, 0)?;

        section.blocks += 3;
    }

    stats.push(section);
    writer.write_empty_block()?;
    Ok(())
}

fn write_lids<W: std::io::Write + std::io::Seek>(
    writer: &mut BlocksWriter<W>,
    stats: &mut SealingStats,
    params: &SealParams,
    sorted_tids: &[(usize, Vec<Tid>)],
    postings: &[Vec<Lid>],
    old_to_new: &[Lid],
) -> Result<()> {
    let mut section = BlockStats {
        name: "lids",
        ..Default::default()
    };
    let opts_level = params.lids_zstd_level;

    let mut block_lids: Vec<Lid> = Vec::with_capacity(LID_BLOCK_CAP);
    let mut offsets: Vec<u32> = vec![0];
    let mut buf = BytesMut::new();

    let mut max_tid: Tid = 0;
    let mut last_max_tid: Tid = 0;
    let mut is_continued = false;

    let mut flush_block = |writer: &mut BlocksWriter<W>,
                           block_lids: &mut Vec<Lid>,
                           offsets: &mut Vec<u32>,
                           is_last_lid: bool,
                           max_tid: Tid,
                           last_max_tid: &mut Tid,
                           is_continued: &mut bool,
                           section: &mut BlockStats|
     -> Result<()> {
        let block = super::sealed::lids::LidsBlock {
            lids: std::mem::take(block_lids),
            offsets: std::mem::replace(offsets, vec![0]),
            is_last_lid,
        };
        buf.clear();
        block.pack(&mut buf);

        // continued blocks keep the historical min_tid = prev_max + 1 form
        let min_tid = *last_max_tid + 1;
        let ext1 = u64::from(*is_continued);
        let ext2 = (max_tid as u64) << 32 | min_tid as u64;
        section.raw += buf.len() as u64;
        section.comp += writer.write_block(&buf, true, opts_level, ext1, ext2)?;
        section.blocks += 1;

        *last_max_tid = max_tid;
        *is_continued = !is_last_lid;
        Ok(())
    };

    for (_, tids) in sorted_tids {
        for &tid in tids {
            max_tid += 1;
            let mut remapped: Vec<Lid> = postings[tid as usize - 1]
                .iter()
                .map(|&lid| old_to_new[lid as usize])
                .collect();
            remapped.sort_unstable();

            let mut rest = remapped.as_slice();
            loop {
                let take = (LID_BLOCK_CAP - block_lids.len()).min(rest.len());
                block_lids.extend_from_slice(&rest[..take]);
                offsets.push(block_lids.len() as u32);
                rest = &rest[take..];

                if block_lids.len() == LID_BLOCK_CAP {
                    flush_block(
                        writer,
                        &mut block_lids,
                        &mut offsets,
                        rest.is_empty(),
                        max_tid,
                        &mut last_max_tid,
                        &mut is_continued,
                        &mut section,
                    )?;
                }
                if rest.is_empty() {
                    break;
                }
            }
        }

        // a field's lists never share a block with the next field's
        if !block_lids.is_empty() {
            flush_block(
                writer,
                &mut block_lids,
                &mut offsets,
                true,
                max_tid,
                &mut last_max_tid,
                &mut is_continued,
                &mut section,
            )?;
        }
    }

    stats.push(section);
    writer.write_empty_block()?;
    Ok(())
}

fn suffixed(base: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    std::path::PathBuf::from(path)
}
