//! Document Identifiers
//!
//! Every document in seqdb is globally identified by the pair `(MID, RID)`:
//!
//! - **MID** is a 64-bit logical timestamp in milliseconds. It is monotone
//!   within a fraction but not unique.
//! - **RID** is a 64-bit random record id that disambiguates documents with
//!   the same MID.
//!
//! Inside a single fraction, documents additionally get a **LID**: the rank
//! of the document after a stable sort by `(MID, RID)` descending. LIDs form
//! a dense range `1..=ids_total`; LID 0 is reserved as the "not found"
//! sentinel. Tokens get a **TID**, unique within the fraction.
//!
//! `DocPos` packs the location of a document body inside the docs file:
//! the docs-block number in the high 32 bits, the offset of the document
//! within the decompressed block payload in the low 32 bits.

use serde::{Deserialize, Serialize};

/// Millisecond timestamp component of a document id.
pub type Mid = u64;

/// Random component of a document id.
pub type Rid = u64;

/// Local document id within one fraction; 0 means "not found".
pub type Lid = u32;

/// Local token id within one fraction.
pub type Tid = u32;

/// Globally unique document id. Ordering is lexicographic by `(mid, rid)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SeqId {
    pub mid: Mid,
    pub rid: Rid,
}

impl SeqId {
    pub fn new(mid: Mid, rid: Rid) -> Self {
        SeqId { mid, rid }
    }
}

impl std::fmt::Display for SeqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.mid, self.rid)
    }
}

/// Position of a document body in the docs file: `(block_index, offset)`
/// packed into a u64. The offset is relative to the decompressed payload of
/// the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocPos(pub u64);

impl DocPos {
    /// Sentinel for "document not present" (LID 0 resolves to this).
    pub const NOT_FOUND: DocPos = DocPos(u64::MAX);

    pub fn new(block_index: u32, offset: u32) -> Self {
        DocPos(((block_index as u64) << 32) | offset as u64)
    }

    pub fn block_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    pub fn is_not_found(self) -> bool {
        self == DocPos::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_id_ordering() {
        let a = SeqId::new(100, 5);
        let b = SeqId::new(100, 6);
        let c = SeqId::new(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_seq_id_equal_ordering() {
        let a = SeqId::new(42, 42);
        let b = SeqId::new(42, 42);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_doc_pos_pack_unpack() {
        let pos = DocPos::new(7, 1234);
        assert_eq!(pos.block_index(), 7);
        assert_eq!(pos.offset(), 1234);
    }

    #[test]
    fn test_doc_pos_extremes() {
        let pos = DocPos::new(u32::MAX - 1, u32::MAX);
        assert_eq!(pos.block_index(), u32::MAX - 1);
        assert_eq!(pos.offset(), u32::MAX);
        assert!(!pos.is_not_found());
        assert!(DocPos::NOT_FOUND.is_not_found());
    }

    #[test]
    fn test_seq_id_display() {
        assert_eq!(SeqId::new(1700000000123, 42).to_string(), "1700000000123.42");
    }
}
