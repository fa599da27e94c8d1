//! Docs Block Reader
//!
//! Reads whole doc blocks out of a `.docs`/`.sdocs` file, decompresses them
//! through the docs cache, and slices individual documents out by their
//! intra-block offsets. Fetch paths group requested documents by block so a
//! block is read and decompressed once per batch.

use std::sync::Arc;

use seqdb_core::{doc, Result};

use crate::block::{BlockHeader, BLOCK_HEADER_LEN};
use crate::cache::Cache;
use crate::read_limiter::ReadLimiter;
use crate::remote::ImmutableFile;

pub struct DocsReader {
    file: Arc<dyn ImmutableFile>,
    limiter: Arc<ReadLimiter>,
    cache: Cache<Arc<Vec<u8>>>,
}

impl DocsReader {
    pub fn new(
        file: Arc<dyn ImmutableFile>,
        limiter: Arc<ReadLimiter>,
        cache: Cache<Arc<Vec<u8>>>,
    ) -> Self {
        DocsReader {
            file,
            limiter,
            cache,
        }
    }

    pub fn file_name(&self) -> &str {
        self.file.name()
    }

    /// Decompressed payload of the block that starts at `block_offset`,
    /// cached under `block_index`.
    pub fn block_payload(&self, block_index: u32, block_offset: u64) -> Result<Arc<Vec<u8>>> {
        let file = self.file.clone();
        let limiter = self.limiter.clone();
        self.cache.get_with(block_index, move || {
            let payload = read_block_payload(file.as_ref(), &limiter, block_offset)?;
            let size = payload.len() as u64;
            Ok((Arc::new(payload), size))
        })
    }

    /// Extract the documents at `doc_offsets` from one block.
    pub fn read_docs(
        &self,
        block_index: u32,
        block_offset: u64,
        doc_offsets: &[u32],
    ) -> Result<Vec<Vec<u8>>> {
        let payload = self.block_payload(block_index, block_offset)?;
        doc_offsets
            .iter()
            .map(|&offset| Ok(doc::doc_at_offset(&payload, offset as usize)?.to_vec()))
            .collect()
    }
}

fn read_block_payload(
    file: &dyn ImmutableFile,
    limiter: &ReadLimiter,
    offset: u64,
) -> Result<Vec<u8>> {
    let mut header_buf = [0u8; BLOCK_HEADER_LEN];
    limiter.read_at(file, &mut header_buf, offset)?;
    let header = BlockHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.len as usize];
    limiter.read_at(file, &mut payload, offset + BLOCK_HEADER_LEN as u64)?;

    crate::block::decompress_payload(&header, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;
    use crate::cache::CacheMaintainer;
    use crate::remote::LocalFile;
    use std::io::Write;

    fn setup(docs: &[&[u8]]) -> (tempfile::TempDir, DocsReader, u64) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq-db-t.docs");

        let payload = doc::encode_docs_payload(docs);
        let block = block::compress_block(&payload, 3, payload.len() as u64, 0).unwrap();
        std::fs::File::create(&path).unwrap().write_all(&block).unwrap();

        let maintainer = CacheMaintainer::new(1 << 20);
        let reader = DocsReader::new(
            Arc::new(LocalFile::open(&path).unwrap()),
            Arc::new(ReadLimiter::new(4)),
            maintainer.new_cache(),
        );
        (dir, reader, 0)
    }

    #[test]
    fn test_read_docs_by_offsets() {
        let docs: Vec<&[u8]> = vec![b"log line one", b"log line two", b"third"];
        let (_dir, reader, offset) = setup(&docs);

        // offsets: each record is 4-byte length + body
        let mut offsets = Vec::new();
        let mut cursor = 0u32;
        for doc in &docs {
            offsets.push(cursor);
            cursor += 4 + doc.len() as u32;
        }

        let got = reader.read_docs(0, offset, &offsets).unwrap();
        assert_eq!(got, docs.iter().map(|d| d.to_vec()).collect::<Vec<_>>());

        // reversed order works too
        let reversed: Vec<u32> = offsets.iter().rev().copied().collect();
        let got = reader.read_docs(0, offset, &reversed).unwrap();
        assert_eq!(got[0], b"third");
    }

    #[test]
    fn test_block_cached_across_reads() {
        let docs: Vec<&[u8]> = vec![b"cached doc"];
        let (_dir, reader, offset) = setup(&docs);

        let first = reader.block_payload(0, offset).unwrap();
        let second = reader.block_payload(0, offset).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_bad_offset_is_corruption() {
        let docs: Vec<&[u8]> = vec![b"only doc"];
        let (_dir, reader, offset) = setup(&docs);
        assert!(reader.read_docs(0, offset, &[10_000]).is_err());
    }
}
