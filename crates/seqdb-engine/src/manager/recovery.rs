//! Startup Recovery
//!
//! Scans the data directory and classifies every `seq-db-*` file by suffix:
//!
//! - `._index` / `._sdocs` tmp files mean a seal never completed; unlink.
//! - Any `.del` marker means a suicide was interrupted; finish the deletion.
//! - `{sdocs, index}` (or `{docs, index}` without meta) is a sealed
//!   fraction; `{meta}` is an active one (replayed by the manager);
//!   `{remote}` is an offloaded fraction.
//! - A `seq-db-*` file with an unclassifiable suffix is fatal: silently
//!   ignoring it risks data loss.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use seqdb_core::{Error, Result};

use crate::frac::{
    remove_file_if_exists, DOCS_DEL_SUFFIX, DOCS_SUFFIX, FILE_BASE_PATTERN, INDEX_DEL_SUFFIX,
    INDEX_SUFFIX, INDEX_TMP_SUFFIX, META_SUFFIX, REMOTE_SUFFIX, SDOCS_DEL_SUFFIX, SDOCS_SUFFIX,
    SDOCS_TMP_SUFFIX,
};

/// Per-fraction file presence discovered by the scan.
#[derive(Debug, Default, Clone)]
pub struct ScannedFrac {
    pub base: PathBuf,
    pub has_docs: bool,
    pub has_docs_del: bool,
    pub has_sdocs: bool,
    pub has_sdocs_del: bool,
    pub has_meta: bool,
    pub has_index: bool,
    pub has_index_del: bool,
    pub has_remote: bool,
}

impl ScannedFrac {
    pub fn has_del_marker(&self) -> bool {
        self.has_docs_del || self.has_sdocs_del || self.has_index_del
    }
}

/// How the manager should treat one scanned fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FracKind {
    Active,
    Sealed,
    Remote,
}

/// Scan the data dir: unlink tmp files, group fraction files, ordered
/// oldest-first (ULIDs sort chronologically).
pub fn scan(data_dir: &Path) -> Result<Vec<ScannedFrac>> {
    let mut fracs: BTreeMap<String, ScannedFrac> = BTreeMap::new();

    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(FILE_BASE_PATTERN) {
            continue;
        }

        let suffix_at = name.find('.').unwrap_or(name.len());
        let (base_name, suffix) = name.split_at(suffix_at);

        if suffix == INDEX_TMP_SUFFIX || suffix == SDOCS_TMP_SUFFIX {
            tracing::info!(file = %name, "removing leftover sealing tmp file");
            remove_file_if_exists(&entry.path())?;
            continue;
        }

        let frac = fracs.entry(base_name.to_string()).or_insert_with(|| {
            tracing::info!(fraction = %base_name, "found fraction files");
            ScannedFrac {
                base: data_dir.join(base_name),
                ..Default::default()
            }
        });

        match suffix {
            DOCS_SUFFIX => frac.has_docs = true,
            DOCS_DEL_SUFFIX => frac.has_docs_del = true,
            SDOCS_SUFFIX => frac.has_sdocs = true,
            SDOCS_DEL_SUFFIX => frac.has_sdocs_del = true,
            META_SUFFIX => frac.has_meta = true,
            INDEX_SUFFIX => frac.has_index = true,
            INDEX_DEL_SUFFIX => frac.has_index_del = true,
            REMOTE_SUFFIX => frac.has_remote = true,
            _ => {
                return Err(Error::corrupted(format!(
                    "unclassifiable file in data dir: {name}"
                )))
            }
        }
    }

    Ok(fracs.into_values().collect())
}

/// Complete an interrupted suicide: delete every remaining file of the
/// fraction (live names first, then the `.del` markers).
pub fn finish_deletion(frac: &ScannedFrac) -> Result<()> {
    tracing::info!(fraction = %frac.base.display(), "cleaning up partially deleted fraction");
    for suffix in [
        INDEX_SUFFIX,
        DOCS_SUFFIX,
        SDOCS_SUFFIX,
        META_SUFFIX,
        INDEX_DEL_SUFFIX,
        DOCS_DEL_SUFFIX,
        SDOCS_DEL_SUFFIX,
    ] {
        remove_file_if_exists(&suffixed(&frac.base, suffix))?;
    }
    Ok(())
}

/// Classify one scanned fraction. `None` means "skip it" (handled or
/// unusable); deletion markers must be resolved before calling this.
pub fn classify(frac: &ScannedFrac, offloading_enabled: bool) -> Option<FracKind> {
    if frac.has_remote {
        if offloading_enabled {
            return Some(FracKind::Remote);
        }
        tracing::warn!(
            fraction = %frac.base.display(),
            "remote fraction found but offloading is disabled, skipping"
        );
        return None;
    }

    if frac.has_sdocs && frac.has_index {
        return Some(FracKind::Sealed);
    }

    if !frac.has_docs && !frac.has_sdocs {
        tracing::error!(
            fraction = %frac.base.display(),
            "fraction has no docs file, skipping"
        );
        return None;
    }

    if frac.has_meta {
        return Some(FracKind::Active);
    }
    if frac.has_index {
        return Some(FracKind::Sealed);
    }

    tracing::error!(
        fraction = %frac.base.display(),
        "fraction has docs but neither index nor meta, skipping"
    );
    None
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn test_scan_groups_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "seq-db-02B.docs");
        touch(dir.path(), "seq-db-02B.meta");
        touch(dir.path(), "seq-db-01A.docs");
        touch(dir.path(), "seq-db-01A.index");
        touch(dir.path(), "unrelated.txt");

        let fracs = scan(dir.path()).unwrap();
        assert_eq!(fracs.len(), 2);
        // oldest (smallest ULID) first
        assert!(fracs[0].base.ends_with("seq-db-01A"));
        assert!(fracs[0].has_index);
        assert!(fracs[1].has_meta);
    }

    #[test]
    fn test_scan_unlinks_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "seq-db-01A._index");
        touch(dir.path(), "seq-db-01A._sdocs");
        touch(dir.path(), "seq-db-01A.docs");
        touch(dir.path(), "seq-db-01A.meta");

        let fracs = scan(dir.path()).unwrap();
        assert_eq!(fracs.len(), 1);
        assert!(!dir.path().join("seq-db-01A._index").exists());
        assert!(!dir.path().join("seq-db-01A._sdocs").exists());
    }

    #[test]
    fn test_scan_rejects_unknown_suffix() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "seq-db-01A.docs");
        touch(dir.path(), "seq-db-01A.surprise");
        assert!(matches!(scan(dir.path()), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_finish_deletion_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "seq-db-01A.docs.del");
        touch(dir.path(), "seq-db-01A.index");

        let fracs = scan(dir.path()).unwrap();
        assert!(fracs[0].has_del_marker());
        finish_deletion(&fracs[0]).unwrap();

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_classify() {
        let mut frac = ScannedFrac {
            base: PathBuf::from("/d/seq-db-X"),
            ..Default::default()
        };

        frac.has_docs = true;
        frac.has_meta = true;
        assert_eq!(classify(&frac, false), Some(FracKind::Active));

        frac.has_meta = false;
        frac.has_index = true;
        assert_eq!(classify(&frac, false), Some(FracKind::Sealed));

        // meta alongside docs+index: still replayed as active
        frac.has_meta = true;
        assert_eq!(classify(&frac, false), Some(FracKind::Active));

        // sdocs+index wins over meta
        frac.has_sdocs = true;
        assert_eq!(classify(&frac, false), Some(FracKind::Sealed));

        let remote = ScannedFrac {
            base: PathBuf::from("/d/seq-db-R"),
            has_remote: true,
            ..Default::default()
        };
        assert_eq!(classify(&remote, true), Some(FracKind::Remote));
        assert_eq!(classify(&remote, false), None);

        let bare = ScannedFrac {
            base: PathBuf::from("/d/seq-db-B"),
            has_index: true,
            ..Default::default()
        };
        assert_eq!(classify(&bare, false), None);
    }
}
