//! Fraction Info
//!
//! The per-fraction header persisted in three places: the first block of the
//! sealed index file (JSON behind the `SEQM` magic), the `.frac-cache`
//! sidecar that accelerates cold starts, and in memory while the fraction is
//! active.
//!
//! `binary_data_ver` selects the IDs-section layout: 1 (current) stores RIDs
//! as fixed little-endian u64s, 0 (legacy) as delta varints. Writers emit
//! v1; readers accept both. The `meta_on_disk` field is zeroed on seal and
//! forced to zero when decoding, so stale values in legacy files never
//! propagate.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use seqdb_core::{Error, Mid, Result, SeqId};

use crate::config::{IDS_PER_BLOCK, LID_BLOCK_CAP, REGULAR_BLOCK_SIZE};

/// Magic prefix of the info block payload.
pub const SEQDB_MAGIC: &[u8; 4] = b"SEQM";

/// Current binary layout version (fixed-LE RIDs).
pub const BINARY_DATA_V1: u32 = 1;

/// Legacy layout version (varint RIDs), still readable.
pub const BINARY_DATA_V0: u32 = 0;

const DISTRIBUTION_MAX_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DISTRIBUTION_BUCKET: Duration = Duration::from_secs(60);
const DISTRIBUTION_SPREAD_THRESHOLD: Duration = Duration::from_secs(600);

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FracInfo {
    #[serde(rename = "name")]
    pub path: String,
    pub ver: String,
    pub binary_data_ver: u32,
    pub docs_total: u32,
    /// Compressed docs bytes on disk.
    pub docs_on_disk: u64,
    /// Raw docs bytes appended.
    pub docs_raw: u64,
    /// Compressed metadata bytes on disk (active only; zero after seal).
    pub meta_on_disk: u64,
    /// Index file size on disk.
    pub index_on_disk: u64,

    pub const_regular_block_size: u32,
    pub const_ids_per_block: u32,
    pub const_lid_block_cap: u32,

    pub from: Mid,
    pub to: Mid,
    pub creation_time: u64,
    pub sealing_time: u64,
    #[serde(default)]
    pub distribution: Option<MidsDistribution>,
}

impl FracInfo {
    pub fn new(path: impl Into<String>) -> Self {
        FracInfo {
            path: path.into(),
            ver: env!("CARGO_PKG_VERSION").to_string(),
            binary_data_ver: BINARY_DATA_V1,
            docs_total: 0,
            docs_on_disk: 0,
            docs_raw: 0,
            meta_on_disk: 0,
            index_on_disk: 0,
            const_regular_block_size: REGULAR_BLOCK_SIZE as u32,
            const_ids_per_block: IDS_PER_BLOCK,
            const_lid_block_cap: LID_BLOCK_CAP as u32,
            from: u64::MAX,
            to: 0,
            creation_time: now_ms(),
            sealing_time: 0,
            distribution: None,
        }
    }

    /// Base file name of the fraction.
    pub fn name(&self) -> String {
        std::path::Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn full_size(&self) -> u64 {
        self.docs_on_disk + self.index_on_disk + self.meta_on_disk
    }

    /// Widen `[from, to]` to cover `mid`.
    pub fn observe_mid(&mut self, mid: Mid) {
        self.from = self.from.min(mid);
        self.to = self.to.max(mid);
    }

    pub fn is_intersecting(&self, from: Mid, to: Mid) -> bool {
        if self.docs_total == 0 {
            // fresh active fraction holds no data yet
            return false;
        }
        if to < self.from || self.to < from {
            return false;
        }
        match &self.distribution {
            Some(dist) => dist.is_intersecting(from, to),
            None => true,
        }
    }

    /// Build the coarse MID histogram used to prune time ranges, when the
    /// fraction's spread into the past warrants it.
    pub fn build_distribution(&mut self, ids: &[SeqId]) {
        let creation = self.creation_time;
        if self.from == u64::MAX
            || creation.saturating_sub(self.from)
                < DISTRIBUTION_SPREAD_THRESHOLD.as_millis() as u64
        {
            return;
        }

        let dist_to = creation;
        let max_interval = DISTRIBUTION_MAX_INTERVAL.as_millis() as u64;
        let dist_from = self.from.max(dist_to.saturating_sub(max_interval));

        let mut dist =
            MidsDistribution::new(dist_from, dist_to, DISTRIBUTION_BUCKET.as_millis() as u64);
        for id in ids {
            dist.add(id.mid);
        }
        self.distribution = Some(dist);
    }

    /// Serialize into the info block payload (magic + JSON).
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(SEQDB_MAGIC);
        // the info struct always serializes
        let json = serde_json::to_vec(self).unwrap_or_default();
        out.extend_from_slice(&json);
        out
    }

    /// Decode an info block payload.
    pub fn unpack(payload: &[u8]) -> Result<FracInfo> {
        if payload.len() < 4 || &payload[..4] != SEQDB_MAGIC {
            return Err(Error::corrupted("index file header magic mismatch"));
        }
        let mut info: FracInfo = serde_json::from_slice(&payload[4..])
            .map_err(|e| Error::corrupted(format!("info block: {e}")))?;
        info.meta_on_disk = 0;
        Ok(info)
    }
}

/// Coarse per-minute presence bitmap over the fraction's MID range. Lets a
/// search skip a fraction whose `[from, to]` span intersects the query range
/// only through empty buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidsDistribution {
    pub from: Mid,
    pub to: Mid,
    pub bucket_ms: u64,
    pub buckets: Vec<bool>,
}

impl MidsDistribution {
    pub fn new(from: Mid, to: Mid, bucket_ms: u64) -> Self {
        let span = to.saturating_sub(from);
        let count = (span / bucket_ms + 1) as usize;
        MidsDistribution {
            from,
            to,
            bucket_ms,
            buckets: vec![false; count],
        }
    }

    fn bucket_of(&self, mid: Mid) -> usize {
        (mid.saturating_sub(self.from) / self.bucket_ms) as usize
    }

    pub fn add(&mut self, mid: Mid) {
        // everything below the tracked window lands in the first bucket,
        // everything above in the last
        let bucket = self.bucket_of(mid.clamp(self.from, self.to));
        let bucket = bucket.min(self.buckets.len() - 1);
        self.buckets[bucket] = true;
    }

    pub fn is_intersecting(&self, from: Mid, to: Mid) -> bool {
        if to < self.from {
            // the whole query range predates the window; only the catch-all
            // first bucket can match
            return self.buckets[0];
        }
        if from > self.to {
            return self.buckets[self.buckets.len() - 1];
        }
        let lo = self.bucket_of(from.clamp(self.from, self.to));
        let hi = self
            .bucket_of(to.clamp(self.from, self.to))
            .min(self.buckets.len() - 1);
        self.buckets[lo..=hi].iter().any(|&b| b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let mut info = FracInfo::new("/data/seq-db-01ABC");
        info.docs_total = 100;
        info.from = 1000;
        info.to = 2000;
        info.meta_on_disk = 555; // must be zeroed on decode

        let payload = info.pack();
        assert_eq!(&payload[..4], b"SEQM");

        let decoded = FracInfo::unpack(&payload).unwrap();
        assert_eq!(decoded.docs_total, 100);
        assert_eq!(decoded.from, 1000);
        assert_eq!(decoded.meta_on_disk, 0);
        assert_eq!(decoded.name(), "seq-db-01ABC");
    }

    #[test]
    fn test_unpack_bad_magic() {
        assert!(FracInfo::unpack(b"XXXX{}").is_err());
        assert!(FracInfo::unpack(b"SE").is_err());
    }

    #[test]
    fn test_empty_fraction_never_intersects() {
        let mut info = FracInfo::new("x");
        assert!(!info.is_intersecting(0, u64::MAX));
        info.docs_total = 1;
        info.from = 100;
        info.to = 200;
        assert!(info.is_intersecting(150, 300));
        assert!(!info.is_intersecting(201, 300));
        assert!(!info.is_intersecting(0, 99));
    }

    #[test]
    fn test_observe_mid() {
        let mut info = FracInfo::new("x");
        info.observe_mid(500);
        info.observe_mid(100);
        info.observe_mid(300);
        assert_eq!(info.from, 100);
        assert_eq!(info.to, 500);
    }

    #[test]
    fn test_distribution_pruning() {
        let mut dist = MidsDistribution::new(60_000, 600_000, 60_000);
        dist.add(120_000);
        dist.add(540_000);

        assert!(dist.is_intersecting(110_000, 130_000));
        assert!(!dist.is_intersecting(200_000, 400_000));
        assert!(dist.is_intersecting(500_000, 700_000));
    }

    #[test]
    fn test_distribution_built_only_for_spread() {
        let now = now_ms();
        let mut info = FracInfo::new("x");
        info.docs_total = 2;
        info.from = now - 1000; // 1s spread: below threshold
        info.to = now;
        info.build_distribution(&[SeqId::new(now - 1000, 1), SeqId::new(now, 2)]);
        assert!(info.distribution.is_none());

        let mut info = FracInfo::new("x");
        info.docs_total = 2;
        info.from = now - 3_600_000; // 1h spread
        info.to = now;
        info.build_distribution(&[SeqId::new(now - 3_600_000, 1), SeqId::new(now, 2)]);
        assert!(info.distribution.is_some());
    }

    #[test]
    fn test_full_size() {
        let mut info = FracInfo::new("x");
        info.docs_on_disk = 10;
        info.meta_on_disk = 20;
        info.index_on_disk = 30;
        assert_eq!(info.full_size(), 60);
    }
}
