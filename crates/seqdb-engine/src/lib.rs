//! seqdb Fraction Lifecycle Engine
//!
//! The storage engine of the seqdb log-search database. Log documents are
//! appended into the *active* fraction, which builds an in-memory inverted
//! index as blocks arrive. When the active fraction outgrows its size budget
//! the manager rotates it out and *seals* it: a deterministic single pass
//! converts the in-memory state into an immutable on-disk `.index` file with
//! a precise block layout. Sealed fractions serve keyword / range / wildcard
//! search, document fetch, histograms and aggregations through lazily-loaded,
//! cached block readers. When total disk usage exceeds retention, the oldest
//! fractions are either deleted or offloaded to a remote object store and
//! kept queryable as *remote* fractions.
//!
//! Crate layout:
//!
//! - [`frac`]: the three fraction kinds and their shared `Fraction` surface;
//! - [`pattern`]: token matching (literal, wildcard, ranges, IP ranges);
//! - [`search`]: the search/fetch processor that runs over any fraction;
//! - [`manager`]: rotation, sealing, retention, offload, crash recovery;
//! - [`async_search`]: long-running searches with persisted progress.

pub mod async_search;
pub mod config;
pub mod context;
pub mod frac;
pub mod manager;
pub mod pattern;
pub mod search;

pub use config::{EngineConfig, SealParams};
pub use context::SearchContext;
pub use frac::info::FracInfo;
pub use manager::FracManager;
pub use search::{AggQuery, SearchParams};
