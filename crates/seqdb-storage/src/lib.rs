//! seqdb Physical Storage Layer
//!
//! This crate implements the byte-level machinery shared by every fraction
//! kind:
//!
//! 1. **Block codec** ([`block`]): every physical block in the `.docs`,
//!    `.sdocs`, `.meta` and `.index` files carries a fixed 33-byte header
//!    (codec, compressed length, raw length, two 64-bit extension words)
//!    followed by an optionally zstd-compressed payload.
//! 2. **Block writer** ([`writer`]): accumulates payloads into
//!    size-threshold blocks, emits them to a write-seeker, tracks per-section
//!    statistics, and appends the trailing block registry.
//! 3. **Index reader** ([`index_reader`]): random-access reads over a sealed
//!    index file; parses the registry on first use and serves
//!    read-by-block-index.
//! 4. **Caches** ([`cache`]): generation-based, byte-bounded caches for
//!    decoded blocks with hit/miss counters and background eviction.
//! 5. **Read limiter** ([`read_limiter`]): a counting semaphore bounding
//!    concurrent `read_at` calls, for local files and remote objects alike.
//! 6. **Remote store** ([`remote`]): the immutable-file object-store
//!    interface used by offloaded fractions, backed by `object_store`.

pub mod block;
pub mod cache;
pub mod docs_reader;
pub mod index_reader;
pub mod read_limiter;
pub mod remote;
pub mod writer;

pub use block::{BlockHeader, Codec, BLOCK_HEADER_LEN};
pub use cache::{Cache, CacheMaintainer, CacheStats};
pub use docs_reader::DocsReader;
pub use index_reader::{IndexReader, Registry};
pub use read_limiter::ReadLimiter;
pub use remote::{ImmutableFile, LocalFile, ObjectStoreClient, RemoteStore};
pub use writer::{BlockFormer, BlockStats, BlocksWriter, FlushOptions, SealingStats};
