//! Fractions
//!
//! A fraction is one time-bounded unit of the store, in one of three states:
//!
//! - [`active::Active`]: open for appends, indexed in memory;
//! - [`sealed::Sealed`]: immutable, all data in `.index` + `.docs`/`.sdocs`;
//! - [`remote::RemoteFrac`]: sealed, with files living in the object store.
//!
//! All three expose the same consumer surface through [`Frac`], a closed
//! variant the manager stores and search fans out over. Data access is
//! scoped: [`Frac::with_data_provider`] read-locks the fraction's use-mutex
//! for the duration of the callback, so suicide never unlinks files under an
//! in-flight reader.

pub mod active;
pub mod info;
pub mod remote;
pub mod sealed;
pub mod sealing;

use std::path::Path;
use std::sync::Arc;

use seqdb_core::{Mid, Qpr, Result, SeqId};
use seqdb_storage::cache::CacheMaintainer;
use seqdb_storage::index_reader::Registry;
use seqdb_storage::remote::RemoteStore;
use seqdb_storage::Cache;

use crate::context::SearchContext;
use crate::search::SearchParams;
use info::FracInfo;

pub const FILE_BASE_PATTERN: &str = "seq-db-";

pub const META_SUFFIX: &str = ".meta";
pub const DOCS_SUFFIX: &str = ".docs";
pub const DOCS_DEL_SUFFIX: &str = ".docs.del";
pub const SDOCS_SUFFIX: &str = ".sdocs";
pub const SDOCS_TMP_SUFFIX: &str = "._sdocs";
pub const SDOCS_DEL_SUFFIX: &str = ".sdocs.del";
pub const INDEX_SUFFIX: &str = ".index";
pub const INDEX_TMP_SUFFIX: &str = "._index";
pub const INDEX_DEL_SUFFIX: &str = ".index.del";
pub const REMOTE_SUFFIX: &str = ".remote";
pub const FRAC_CACHE_FILE: &str = ".frac-cache";
pub const IMMATURE_FILE: &str = ".immature";

/// Search + fetch surface handed out under the fraction's use lock.
pub trait DataProvider {
    fn search(&self, params: &SearchParams, ctx: &SearchContext) -> Result<Qpr>;

    fn fetch(&self, ids: &[SeqId], ctx: &SearchContext) -> Result<Vec<Vec<u8>>>;
}

/// Provider of a suicided fraction: every operation yields empty results.
pub struct EmptyDataProvider;

impl DataProvider for EmptyDataProvider {
    fn search(&self, _params: &SearchParams, _ctx: &SearchContext) -> Result<Qpr> {
        Ok(Qpr::default())
    }

    fn fetch(&self, ids: &[SeqId], _ctx: &SearchContext) -> Result<Vec<Vec<u8>>> {
        Ok(vec![Vec::new(); ids.len()])
    }
}

/// The per-fraction cache bundle; all bundles share one maintainer. Clones
/// share the same underlying caches (sealing hands the active's bundle to
/// the sealed fraction it produces).
#[derive(Clone)]
pub struct FracCaches {
    pub registry: Cache<Arc<Registry>>,
    pub tokens: Cache<Arc<sealed::token::TokenBlock>>,
    pub token_table: Cache<Arc<sealed::token::TokenTable>>,
    pub lids: Cache<Arc<sealed::lids::LidsBlock>>,
    pub mids: Cache<Arc<Vec<u64>>>,
    pub rids: Cache<Arc<Vec<u64>>>,
    pub params: Cache<Arc<Vec<u64>>>,
    pub docs: Cache<Arc<Vec<u8>>>,
}

impl FracCaches {
    pub fn new(maintainer: &Arc<CacheMaintainer>) -> Self {
        FracCaches {
            registry: maintainer.new_cache(),
            tokens: maintainer.new_cache(),
            token_table: maintainer.new_cache(),
            lids: maintainer.new_cache(),
            mids: maintainer.new_cache(),
            rids: maintainer.new_cache(),
            params: maintainer.new_cache(),
            docs: maintainer.new_cache(),
        }
    }

    /// Drop every cached entry of this fraction.
    pub fn release(&self) {
        self.registry.release();
        self.tokens.release();
        self.token_table.release();
        self.lids.release();
        self.mids.release();
        self.rids.release();
        self.params.release();
        self.docs.release();
    }
}

/// Closed variant over the three fraction kinds.
#[derive(Clone)]
pub enum Frac {
    Active(Arc<active::Active>),
    Sealed(Arc<sealed::Sealed>),
    Remote(Arc<remote::RemoteFrac>),
}

impl Frac {
    pub fn info(&self) -> FracInfo {
        match self {
            Frac::Active(f) => f.info(),
            Frac::Sealed(f) => f.info(),
            Frac::Remote(f) => f.info(),
        }
    }

    pub fn is_intersecting(&self, from: Mid, to: Mid) -> bool {
        self.info().is_intersecting(from, to)
    }

    pub fn contains(&self, mid: Mid) -> bool {
        self.is_intersecting(mid, mid)
    }

    /// Run `f` against the fraction's data provider while holding its use
    /// lock. A suicided fraction serves the empty provider.
    pub fn with_data_provider<R>(
        &self,
        f: impl FnOnce(&dyn DataProvider) -> Result<R>,
    ) -> Result<R> {
        match self {
            Frac::Active(frac) => frac.with_data_provider(f),
            Frac::Sealed(frac) => frac.with_data_provider(f),
            Frac::Remote(frac) => frac.with_data_provider(f),
        }
    }

    /// Delete the fraction's files (or remote objects) using the `.del`
    /// rename protocol; waits out in-flight readers.
    pub fn suicide(&self) {
        match self {
            Frac::Active(f) => f.suicide(),
            Frac::Sealed(f) => f.suicide(),
            Frac::Remote(f) => f.suicide(),
        }
    }

    /// Upload the fraction's files to the remote store and drop the local
    /// sentinel. Only sealed fractions can be offloaded.
    pub async fn offload(&self, store: &dyn RemoteStore) -> Result<bool> {
        match self {
            Frac::Sealed(f) => f.offload(store).await,
            // an active outsider has not been sealed yet; suicide it instead
            Frac::Active(_) => Ok(false),
            Frac::Remote(_) => Ok(false),
        }
    }
}

/// Fsync the directory containing `path`, making a rename/create durable.
pub fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Remove a file, tolerating its absence.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(file = %path.display(), "removed file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Rename a file, tolerating a missing source.
pub fn rename_if_exists(from: &Path, to: &Path) -> Result<bool> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
