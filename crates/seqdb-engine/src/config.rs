//! Engine Configuration
//!
//! Controls fraction sizing, retention, caches, worker pools and sealing
//! parameters. Defaults match the constants every sealed fraction records in
//! its info block; readers always honor the constants from the file, not the
//! current config, so fractions sealed under different settings stay
//! readable.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of document ids per MID/RID/pos block triplet.
pub const IDS_PER_BLOCK: u32 = 4096;

/// Raw-size threshold of token and token-table blocks.
pub const REGULAR_BLOCK_SIZE: usize = 16 * 1024;

/// Buffer hint for the positions block.
pub const IDS_BLOCK_SIZE: usize = 4 * 1024;

/// Capacity of one LID block, in LID entries.
pub const LID_BLOCK_CAP: usize = 64 * 1024;

/// Percent of `frac_size` above which the active fraction is sealed on exit.
pub const SEAL_ON_EXIT_FRAC_SIZE_PERCENT: u64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding all fraction files.
    pub data_dir: PathBuf,

    /// Rotate the active fraction when its docs file exceeds this size.
    #[serde(default = "default_frac_size")]
    pub frac_size: u64,

    /// Evict oldest fractions when local fractions exceed this total size.
    #[serde(default = "default_total_size")]
    pub total_size: u64,

    /// Period of the manager maintenance loop.
    #[serde(default = "default_maintenance_delay", with = "duration_ms")]
    pub maintenance_delay: Duration,

    /// Total byte budget of the shared block caches.
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,

    /// Period of cache generation advancement and eviction.
    #[serde(default = "default_cache_gc_delay", with = "duration_ms")]
    pub cache_gc_delay: Duration,

    /// Bound on concurrent block reads (local and remote).
    #[serde(default = "default_reader_workers")]
    pub reader_workers: usize,

    /// Indexer worker threads per active fraction.
    #[serde(default = "default_indexer_workers")]
    pub indexer_workers: usize,

    /// Submit appends to the OS page cache without fsync.
    #[serde(default)]
    pub skip_fsync: bool,

    /// Bound on concurrent bulk appends; excess is rejected retryably.
    #[serde(default = "default_inflight_bulks")]
    pub inflight_bulks: usize,

    /// Keep only the newest N fractions at startup (0 = no limit).
    #[serde(default)]
    pub frac_load_limit: usize,

    /// Offloading to remote storage; `None` disables it.
    #[serde(default)]
    pub offloading: Option<OffloadConfig>,

    /// Sealing parameters.
    #[serde(default)]
    pub seal: SealParams,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        EngineConfig {
            data_dir: data_dir.into(),
            frac_size: default_frac_size(),
            total_size: default_total_size(),
            maintenance_delay: default_maintenance_delay(),
            cache_size: default_cache_size(),
            cache_gc_delay: default_cache_gc_delay(),
            reader_workers: default_reader_workers(),
            indexer_workers: default_indexer_workers(),
            skip_fsync: false,
            inflight_bulks: default_inflight_bulks(),
            frac_load_limit: 0,
            offloading: None,
            seal: SealParams::default(),
        }
    }

    /// Minimum size the active must reach to be worth sealing on shutdown.
    pub fn min_frac_size_to_seal(&self) -> u64 {
        self.frac_size * SEAL_ON_EXIT_FRAC_SIZE_PERCENT / 100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Remote fractions older than this are deleted from the remote store;
    /// zero keeps them forever.
    #[serde(default, with = "duration_ms")]
    pub retention: Duration,
}

/// Per-section zstd levels used at seal time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealParams {
    #[serde(default = "default_zstd_level")]
    pub ids_zstd_level: i32,
    #[serde(default = "default_zstd_level")]
    pub tokens_zstd_level: i32,
    #[serde(default = "default_zstd_level")]
    pub token_table_zstd_level: i32,
    #[serde(default = "default_zstd_level")]
    pub lids_zstd_level: i32,
}

impl Default for SealParams {
    fn default() -> Self {
        SealParams {
            ids_zstd_level: default_zstd_level(),
            tokens_zstd_level: default_zstd_level(),
            token_table_zstd_level: default_zstd_level(),
            lids_zstd_level: default_zstd_level(),
        }
    }
}

fn default_frac_size() -> u64 {
    128 * 1024 * 1024
}

fn default_total_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_maintenance_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_cache_size() -> u64 {
    256 * 1024 * 1024
}

fn default_cache_gc_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_reader_workers() -> usize {
    32
}

fn default_indexer_workers() -> usize {
    4
}

fn default_inflight_bulks() -> usize {
    32
}

fn default_zstd_level() -> i32 {
    3
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
