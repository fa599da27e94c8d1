//! Block Writer and Block Former
//!
//! `BlocksWriter` emits complete blocks to an underlying write-seeker and
//! remembers, for every block, its file offset and extension words. When the
//! file is complete, `write_registry` appends that table as the very last
//! block and stores its offset in the trailing 8 bytes of the file, which is
//! where the reader starts.
//!
//! `BlockFormer` sits on top: callers append payload into its buffer and the
//! former flushes a block whenever the buffer crosses the size threshold.
//! Each former tracks raw/compressed byte counts per section, collected into
//! `SealingStats` and logged after a seal.

use std::io::{Seek, SeekFrom, Write};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};

use seqdb_core::{Error, Result};

use crate::block;

/// Default zstd level for sections that do not override it.
pub const ZSTD_FASTEST_LEVEL: i32 = 1;

#[derive(Debug, Clone, Copy)]
struct RegistryEntry {
    offset: u64,
    ext1: u64,
    ext2: u64,
}

/// Writes blocks sequentially and tracks the registry.
pub struct BlocksWriter<W: Write + Seek> {
    writer: W,
    offset: u64,
    entries: Vec<RegistryEntry>,
}

impl<W: Write + Seek> BlocksWriter<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        let offset = writer.seek(SeekFrom::End(0))?;
        Ok(BlocksWriter {
            writer,
            offset,
            entries: Vec::new(),
        })
    }

    /// Index the next written block will get.
    pub fn block_index(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Bytes emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    /// Write one block. Returns the on-disk size of the block (header
    /// included).
    pub fn write_block(
        &mut self,
        payload: &[u8],
        compress: bool,
        level: i32,
        ext1: u64,
        ext2: u64,
    ) -> Result<u64> {
        let bytes = if compress {
            block::compress_block(payload, level, ext1, ext2)?
        } else {
            block::pack_block(payload, ext1, ext2)
        };

        self.entries.push(RegistryEntry {
            offset: self.offset,
            ext1,
            ext2,
        });

        self.writer.write_all(&bytes)?;
        self.offset += bytes.len() as u64;
        Ok(bytes.len() as u64)
    }

    /// Write the empty block that separates index sections.
    pub fn write_empty_block(&mut self) -> Result<()> {
        self.write_block(&[], false, 0, 0, 0)?;
        Ok(())
    }

    /// Append the registry block and the trailing pointer to it, then flush.
    pub fn write_registry(&mut self) -> Result<()> {
        let registry_offset = self.offset;

        let mut payload = BytesMut::with_capacity(4 + self.entries.len() * 24);
        payload.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            payload.put_u64_le(entry.offset);
            payload.put_u64_le(entry.ext1);
            payload.put_u64_le(entry.ext2);
        }

        let bytes = block::compress_block(&payload, ZSTD_FASTEST_LEVEL, 0, 0)?;
        self.writer.write_all(&bytes)?;
        self.offset += bytes.len() as u64;

        self.writer.write_all(&registry_offset.to_le_bytes())?;
        self.offset += 8;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Per-section write statistics.
#[derive(Debug, Clone, Default)]
pub struct BlockStats {
    pub name: &'static str,
    pub raw: u64,
    pub comp: u64,
    pub blocks: u64,
    pub duration: Duration,
}

/// Statistics of a whole sealing pass, one entry per section.
pub type SealingStats = Vec<BlockStats>;

/// Options applied to one flushed block.
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    pub ext1: u64,
    pub ext2: u64,
    pub level: i32,
}

impl Default for FlushOptions {
    fn default() -> Self {
        FlushOptions {
            ext1: 0,
            ext2: 0,
            level: ZSTD_FASTEST_LEVEL,
        }
    }
}

impl FlushOptions {
    pub fn level(level: i32) -> Self {
        FlushOptions {
            level,
            ..Default::default()
        }
    }

    pub fn with_ext(mut self, ext1: u64, ext2: u64) -> Self {
        self.ext1 = ext1;
        self.ext2 = ext2;
        self
    }
}

/// Accumulates payload and flushes size-threshold blocks to a writer.
pub struct BlockFormer<'a, W: Write + Seek> {
    pub buf: BytesMut,
    writer: &'a mut BlocksWriter<W>,
    threshold: usize,
    start: Instant,
    stats: BlockStats,
}

impl<'a, W: Write + Seek> BlockFormer<'a, W> {
    pub fn new(name: &'static str, writer: &'a mut BlocksWriter<W>, threshold: usize) -> Self {
        BlockFormer {
            buf: BytesMut::with_capacity(threshold),
            writer,
            threshold,
            start: Instant::now(),
            stats: BlockStats {
                name,
                ..Default::default()
            },
        }
    }

    /// Index the next flushed block will get.
    pub fn block_index(&self) -> u32 {
        self.writer.block_index()
    }

    /// Flush when the buffer crossed the threshold. Returns whether a flush
    /// happened.
    pub fn flush_if_needed(&mut self, opts: FlushOptions) -> Result<bool> {
        if self.buf.len() > self.threshold {
            self.flush_forced(opts)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flush the buffer as one block regardless of size. Empty buffers are a
    /// no-op (they never produce separator blocks by accident).
    pub fn flush_forced(&mut self, opts: FlushOptions) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let written =
            self.writer
                .write_block(&self.buf, true, opts.level, opts.ext1, opts.ext2)?;

        self.stats.blocks += 1;
        self.stats.raw += self.buf.len() as u64;
        self.stats.comp += written;
        self.buf.clear();
        Ok(())
    }

    pub fn finish(mut self) -> BlockStats {
        self.stats.duration = self.start.elapsed();
        self.stats
    }
}

/// Decode a registry payload (count-prefixed offset/ext triples).
pub fn decode_registry(payload: &[u8]) -> Result<Vec<(u64, u64, u64)>> {
    let mut dec = seqdb_core::varint::Decoder::new(payload);
    let count = dec.get_u32_le()? as usize;
    if dec.remaining() != count * 24 {
        return Err(Error::corrupted(format!(
            "registry size mismatch: {} entries declared, {} bytes left",
            count,
            dec.remaining()
        )));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = dec.get_u64_le()?;
        let ext1 = dec.get_u64_le()?;
        let ext2 = dec.get_u64_le()?;
        entries.push((offset, ext1, ext2));
    }
    Ok(entries)
}
