//! Fraction Info Sidecar Cache
//!
//! `<data_dir>/.frac-cache` holds the info of every known fraction as JSON,
//! so a cold start can list fractions without reading each index file's info
//! block. The cache is advisory: a missing or stale entry only costs an
//! extra header read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use seqdb_core::Result;

use crate::frac::info::FracInfo;

pub struct FracCache {
    path: PathBuf,
    entries: Mutex<Entries>,
}

struct Entries {
    infos: HashMap<String, FracInfo>,
    dirty: bool,
}

impl FracCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FracCache {
            path: path.into(),
            entries: Mutex::new(Entries {
                infos: HashMap::new(),
                dirty: false,
            }),
        }
    }

    /// Load entries from disk; unreadable caches start empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let infos = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<HashMap<String, FracInfo>>(&bytes).ok())
            .unwrap_or_default();
        if !infos.is_empty() {
            tracing::info!(entries = infos.len(), "loaded fraction cache");
        }
        FracCache {
            path,
            entries: Mutex::new(Entries {
                infos,
                dirty: false,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<FracInfo> {
        self.entries.lock().unwrap().infos.get(name).cloned()
    }

    pub fn add(&self, name: &str, info: FracInfo) {
        let mut entries = self.entries.lock().unwrap();
        entries.infos.insert(name.to_string(), info);
        entries.dirty = true;
    }

    pub fn remove(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.infos.remove(name).is_some() {
            entries.dirty = true;
        }
    }

    /// Persist when dirty; atomic via tmp + rename.
    pub fn sync_to_disk(&self) -> Result<()> {
        let payload = {
            let mut entries = self.entries.lock().unwrap();
            if !entries.dirty {
                return Ok(());
            }
            entries.dirty = false;
            serde_json::to_vec(&entries.infos)
                .map_err(|e| seqdb_core::Error::corrupted(format!("frac cache encode: {e}")))?
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
