//! Disk Block Format
//!
//! Every physical block starts with a 33-byte little-endian header:
//!
//! ```text
//! offset 0  : codec       (1 byte: 0 = none, 1 = zstd)
//! offset 1  : length      (u64, compressed payload size, header excluded)
//! offset 9  : raw_length  (u64, payload size after decompression)
//! offset 17 : ext1        (u64, section-specific tag)
//! offset 25 : ext2        (u64, section-specific tag)
//! offset 33 : payload     (length bytes)
//! ```
//!
//! The extension words are interpreted per section: the minimum `(MID, RID)`
//! of an IDs block, `(max_tid << 32) | min_tid` plus a continuation flag for
//! LID blocks, the raw payload length and own file offset for docs blocks.
//!
//! A block with `length == 0` is the empty block used as a section separator
//! in the index file.

use seqdb_core::{Error, Result};

pub const BLOCK_HEADER_LEN: usize = 33;

const OFFSET_CODEC: usize = 0;
const OFFSET_LEN: usize = 1;
const OFFSET_RAW_LEN: usize = 9;
const OFFSET_EXT1: usize = 17;
const OFFSET_EXT2: usize = 25;

/// Payload compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Zstd = 1,
}

impl TryFrom<u8> for Codec {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            _ => Err(Error::corrupted(format!("unknown block codec: {value}"))),
        }
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub codec: Codec,
    pub len: u64,
    pub raw_len: u64,
    pub ext1: u64,
    pub ext2: u64,
}

impl BlockHeader {
    pub fn decode(buf: &[u8]) -> Result<BlockHeader> {
        if buf.len() < BLOCK_HEADER_LEN {
            return Err(Error::corrupted("truncated block header"));
        }
        Ok(BlockHeader {
            codec: Codec::try_from(buf[OFFSET_CODEC])?,
            len: read_u64(buf, OFFSET_LEN),
            raw_len: read_u64(buf, OFFSET_RAW_LEN),
            ext1: read_u64(buf, OFFSET_EXT1),
            ext2: read_u64(buf, OFFSET_EXT2),
        })
    }

    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        buf[OFFSET_CODEC] = self.codec as u8;
        buf[OFFSET_LEN..OFFSET_LEN + 8].copy_from_slice(&self.len.to_le_bytes());
        buf[OFFSET_RAW_LEN..OFFSET_RAW_LEN + 8].copy_from_slice(&self.raw_len.to_le_bytes());
        buf[OFFSET_EXT1..OFFSET_EXT1 + 8].copy_from_slice(&self.ext1.to_le_bytes());
        buf[OFFSET_EXT2..OFFSET_EXT2 + 8].copy_from_slice(&self.ext2.to_le_bytes());
        buf
    }

    /// Header plus payload length.
    pub fn full_len(&self) -> u64 {
        BLOCK_HEADER_LEN as u64 + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Build a complete block (header + payload), compressing with zstd at
/// `level`. Falls back to the stored form when compression does not shrink
/// the payload.
pub fn compress_block(payload: &[u8], level: i32, ext1: u64, ext2: u64) -> Result<Vec<u8>> {
    let compressed = zstd::bulk::compress(payload, level)
        .map_err(|e| Error::corrupted(format!("zstd compress: {e}")))?;

    if compressed.len() >= payload.len() {
        return Ok(pack_block(payload, ext1, ext2));
    }

    let header = BlockHeader {
        codec: Codec::Zstd,
        len: compressed.len() as u64,
        raw_len: payload.len() as u64,
        ext1,
        ext2,
    };
    let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + compressed.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Build a complete stored (uncompressed) block.
pub fn pack_block(payload: &[u8], ext1: u64, ext2: u64) -> Vec<u8> {
    let header = BlockHeader {
        codec: Codec::None,
        len: payload.len() as u64,
        raw_len: payload.len() as u64,
        ext1,
        ext2,
    };
    let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload);
    out
}

/// Decompress a block payload according to its header.
pub fn decompress_payload(header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() as u64 != header.len {
        return Err(Error::corrupted(format!(
            "block payload length mismatch: header says {}, got {}",
            header.len,
            payload.len()
        )));
    }
    match header.codec {
        Codec::None => Ok(payload.to_vec()),
        Codec::Zstd => {
            let raw = zstd::bulk::decompress(payload, header.raw_len as usize)
                .map_err(|e| Error::corrupted(format!("zstd decompress: {e}")))?;
            if raw.len() as u64 != header.raw_len {
                return Err(Error::corrupted(format!(
                    "block raw length mismatch: header says {}, got {}",
                    header.raw_len,
                    raw.len()
                )));
            }
            Ok(raw)
        }
    }
}

/// Decode a complete block (as produced by `compress_block`/`pack_block`),
/// returning the header and the decompressed payload.
pub fn decode_block(block: &[u8]) -> Result<(BlockHeader, Vec<u8>)> {
    let header = BlockHeader::decode(block)?;
    if (block.len() as u64) < header.full_len() {
        return Err(Error::corrupted("truncated block payload"));
    }
    let payload = &block[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + header.len as usize];
    let raw = decompress_payload(&header, payload)?;
    Ok((header, raw))
}

/// Patch the extension words of an already-built block in place. The active
/// append path uses this to stamp the docs length and offset into a meta
/// block that arrived pre-compressed.
pub fn set_exts(block: &mut [u8], ext1: u64, ext2: u64) {
    block[OFFSET_EXT1..OFFSET_EXT1 + 8].copy_from_slice(&ext1.to_le_bytes());
    block[OFFSET_EXT2..OFFSET_EXT2 + 8].copy_from_slice(&ext2.to_le_bytes());
}
