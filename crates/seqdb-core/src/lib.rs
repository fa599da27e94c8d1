//! Core Types for seqdb
//!
//! This crate holds the vocabulary shared by every layer of the seqdb
//! storage engine:
//!
//! - **Document identifiers** ([`ids`]): the `(MID, RID)` pair that globally
//!   identifies a document, plus the per-fraction local ids (LID, TID) and
//!   packed document positions.
//! - **Varint codecs** ([`varint`]): LEB128 and zigzag encoding used by the
//!   delta-compressed on-disk blocks.
//! - **Document metadata** ([`doc`]): the typed metadata record that drives
//!   indexing, its binary wire format, and the field tokenizers.
//! - **Query AST** ([`query`]): the expression tree produced by the (external)
//!   query parser and consumed by the search operators.
//! - **Query partial results** ([`qpr`]): the associatively-mergeable search
//!   result carried across fractions and replicas.
//! - **Errors** ([`error`]): the error taxonomy shared by all crates.

pub mod doc;
pub mod error;
pub mod ids;
pub mod qpr;
pub mod query;
pub mod varint;

pub use doc::{MetaData, Token};
pub use error::{Error, Result};
pub use ids::{DocPos, Lid, Mid, Rid, SeqId, Tid};
pub use qpr::{DocsOrder, Qpr};
