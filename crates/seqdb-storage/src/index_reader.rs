//! Index File Reader
//!
//! Random-access reader over a sealed `.index` file. The last 8 bytes of the
//! file point at the registry block; the registry maps every block index to
//! its file offset and the two header extension words. The registry is
//! parsed once (through the registry cache, so it is released with its
//! fraction) and every subsequent read is a bounded `read_at` by block index.
//!
//! Block lengths are derived from consecutive registry offsets, which lets
//! the sealed-fraction loader walk section boundaries (empty separator
//! blocks) without touching any payload.

use std::sync::Arc;

use seqdb_core::{Error, Result};

use crate::block::{self, BlockHeader, BLOCK_HEADER_LEN};
use crate::cache::Cache;
use crate::read_limiter::ReadLimiter;
use crate::remote::ImmutableFile;
use crate::writer::decode_registry;

/// Parsed block registry of one index file.
pub struct Registry {
    /// `(file_offset, ext1, ext2)` per block, dense by block index.
    entries: Vec<(u64, u64, u64)>,
    /// File offset of the registry block itself (bounds the last data block).
    registry_offset: u64,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offset(&self, index: u32) -> Result<u64> {
        self.entry(index).map(|e| e.0)
    }

    pub fn exts(&self, index: u32) -> Result<(u64, u64)> {
        self.entry(index).map(|e| (e.1, e.2))
    }

    /// On-disk size of the block, header included.
    pub fn block_size(&self, index: u32) -> Result<u64> {
        let start = self.offset(index)?;
        let end = match self.entries.get(index as usize + 1) {
            Some(next) => next.0,
            None => self.registry_offset,
        };
        if end < start + BLOCK_HEADER_LEN as u64 {
            return Err(Error::corrupted(format!(
                "registry offsets inconsistent at block {index}"
            )));
        }
        Ok(end - start)
    }

    /// True when the block is the zero-length section separator.
    pub fn is_empty_block(&self, index: u32) -> Result<bool> {
        Ok(self.block_size(index)? == BLOCK_HEADER_LEN as u64)
    }

    pub fn size_bytes(&self) -> u64 {
        (self.entries.len() * 24) as u64
    }

    fn entry(&self, index: u32) -> Result<&(u64, u64, u64)> {
        self.entries.get(index as usize).ok_or_else(|| {
            Error::corrupted(format!(
                "block index {index} out of registry range {}",
                self.entries.len()
            ))
        })
    }
}

/// Random-access reader over one index file.
pub struct IndexReader {
    file: Arc<dyn ImmutableFile>,
    limiter: Arc<ReadLimiter>,
    registry_cache: Cache<Arc<Registry>>,
}

impl IndexReader {
    pub fn new(
        file: Arc<dyn ImmutableFile>,
        limiter: Arc<ReadLimiter>,
        registry_cache: Cache<Arc<Registry>>,
    ) -> Self {
        IndexReader {
            file,
            limiter,
            registry_cache,
        }
    }

    pub fn file_name(&self) -> &str {
        self.file.name()
    }

    pub fn registry(&self) -> Result<Arc<Registry>> {
        let file = self.file.clone();
        let limiter = self.limiter.clone();
        self.registry_cache.get_with(0, move || {
            let registry = load_registry(file.as_ref(), &limiter)?;
            let size = registry.size_bytes();
            Ok((Arc::new(registry), size))
        })
    }

    /// Number of blocks before the registry.
    pub fn blocks_total(&self) -> Result<u32> {
        Ok(self.registry()?.len() as u32)
    }

    /// Read only the 33-byte header of a block.
    pub fn block_header(&self, index: u32) -> Result<BlockHeader> {
        let registry = self.registry()?;
        let offset = registry.offset(index)?;
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        self.limiter.read_at(self.file.as_ref(), &mut buf, offset)?;
        BlockHeader::decode(&buf)
    }

    /// Read and decompress one block's payload.
    pub fn read_block(&self, index: u32) -> Result<Vec<u8>> {
        let registry = self.registry()?;
        let offset = registry.offset(index)?;
        let size = registry.block_size(index)?;

        let mut buf = vec![0u8; size as usize];
        self.limiter.read_at(self.file.as_ref(), &mut buf, offset)?;

        let (_, payload) = block::decode_block(&buf)
            .map_err(|e| Error::corrupted(format!("{}: block {index}: {e}", self.file.name())))?;
        Ok(payload)
    }
}

fn load_registry(file: &dyn ImmutableFile, limiter: &ReadLimiter) -> Result<Registry> {
    let size = file.size()?;
    if size < 8 + BLOCK_HEADER_LEN as u64 {
        return Err(Error::corrupted(format!(
            "{}: index file too short: {size} bytes",
            file.name()
        )));
    }

    let mut tail = [0u8; 8];
    limiter.read_at(file, &mut tail, size - 8)?;
    let registry_offset = u64::from_le_bytes(tail);

    if registry_offset + BLOCK_HEADER_LEN as u64 > size - 8 {
        return Err(Error::corrupted(format!(
            "{}: registry offset {registry_offset} out of file bounds",
            file.name()
        )));
    }

    let mut block_buf = vec![0u8; (size - 8 - registry_offset) as usize];
    limiter.read_at(file, &mut block_buf, registry_offset)?;

    let (_, payload) = block::decode_block(&block_buf)
        .map_err(|e| Error::corrupted(format!("{}: registry block: {e}", file.name())))?;
    let entries = decode_registry(&payload)?;

    Ok(Registry {
        entries,
        registry_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheMaintainer;
    use crate::remote::LocalFile;
    use crate::writer::BlocksWriter;
    use std::io::Write;

    fn write_index(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("seq-db-t.index");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = BlocksWriter::new(file).unwrap();
        writer
            .write_block(b"info payload", false, 0, 0, 0)
            .unwrap();
        writer
            .write_block(&b"token payload ".repeat(64), true, 1, 5, 6)
            .unwrap();
        writer.write_empty_block().unwrap();
        writer.write_registry().unwrap();
        writer.into_inner().sync_all().unwrap();
        path
    }

    fn reader_for(path: &std::path::Path) -> IndexReader {
        let maintainer = CacheMaintainer::new(1 << 20);
        IndexReader::new(
            Arc::new(LocalFile::open(path).unwrap()),
            Arc::new(ReadLimiter::new(4)),
            maintainer.new_cache(),
        )
    }

    #[test]
    fn test_registry_parse_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path());
        let reader = reader_for(&path);

        assert_eq!(reader.blocks_total().unwrap(), 3);

        assert_eq!(reader.read_block(0).unwrap(), b"info payload");
        assert_eq!(reader.read_block(1).unwrap(), b"token payload ".repeat(64));
        assert_eq!(reader.read_block(2).unwrap(), b"");

        let header = reader.block_header(1).unwrap();
        assert_eq!(header.ext1, 5);
        assert_eq!(header.ext2, 6);
    }

    #[test]
    fn test_empty_block_detection_without_payload_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path());
        let reader = reader_for(&path);

        let registry = reader.registry().unwrap();
        assert!(!registry.is_empty_block(0).unwrap());
        assert!(!registry.is_empty_block(1).unwrap());
        assert!(registry.is_empty_block(2).unwrap());
        assert_eq!(registry.exts(1).unwrap(), (5, 6));
    }

    #[test]
    fn test_out_of_range_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path());
        let reader = reader_for(&path);
        assert!(reader.read_block(99).is_err());
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq-db-bad.index");
        std::fs::File::create(&path).unwrap().write_all(b"abc").unwrap();
        let reader = reader_for(&path);
        assert!(matches!(
            reader.registry(),
            Err(seqdb_core::Error::Corruption(_))
        ));
    }

    #[test]
    fn test_bogus_registry_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path());

        // overwrite the trailing pointer with garbage
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let reader = reader_for(&path);
        assert!(matches!(
            reader.registry(),
            Err(seqdb_core::Error::Corruption(_))
        ));
    }
}
