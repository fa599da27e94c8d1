//! Sealed Fraction
//!
//! Immutable fraction backed by `.index` plus `.docs`/`.sdocs`. The heavy
//! state (section tables) loads lazily on the first data-provider request
//! and is guarded by a load mutex; every read operation holds the use lock
//! so `suicide`/`offload` wait out in-flight readers before touching files.

pub mod ids;
pub mod lids;
pub mod loader;
pub mod token;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use seqdb_core::query::TokenExpr;
use seqdb_core::{DocPos, Error, Lid, Mid, Qpr, Result, Rid, SeqId, Tid};
use seqdb_storage::remote::{LocalFile, RemoteStore};
use seqdb_storage::{DocsReader, IndexReader, ReadLimiter};

use super::info::FracInfo;
use super::{
    remove_file_if_exists, rename_if_exists, sync_parent_dir, DataProvider, EmptyDataProvider,
    FracCaches, DOCS_DEL_SUFFIX, DOCS_SUFFIX, INDEX_DEL_SUFFIX, INDEX_SUFFIX, REMOTE_SUFFIX,
    SDOCS_DEL_SUFFIX, SDOCS_SUFFIX,
};
use crate::context::SearchContext;
use crate::pattern;
use crate::search::{self, FracFetchIndex, FracSearchIndex, LidIter, SearchParams};
use ids::IdsProvider;
use lids::{LidsCursor, LidsLoader};
use token::{SealedTokenProvider, TokenBlockLoader, TokenTableLoader};

/// Test hook emulating a hard shutdown in the middle of the suicide file
/// dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartialSuicide {
    Off = 0,
    HalfRename = 1,
    HalfRemove = 2,
}

pub(crate) struct LoadedState {
    pub(crate) index_reader: Arc<IndexReader>,
    pub(crate) docs_reader: DocsReader,
    pub(crate) state: loader::SealedState,
}

pub struct Sealed {
    base_path: PathBuf,
    info: RwLock<FracInfo>,
    caches: FracCaches,
    limiter: Arc<ReadLimiter>,
    use_mu: RwLock<()>,
    suicided: AtomicBool,
    load_mu: Mutex<()>,
    loaded: RwLock<Option<Arc<LoadedState>>>,
    index_reader: Mutex<Option<Arc<IndexReader>>>,
    partial_suicide: AtomicU8,
}

impl Sealed {
    /// Open a sealed fraction. With a cached info (from `.frac-cache` or a
    /// fresh seal) the index file is not touched until the first read;
    /// otherwise the info block is read eagerly.
    pub fn open(
        base_path: impl Into<PathBuf>,
        limiter: Arc<ReadLimiter>,
        caches: FracCaches,
        cached_info: Option<FracInfo>,
    ) -> Result<Arc<Sealed>> {
        let base_path: PathBuf = base_path.into();

        let sealed = Sealed {
            base_path: base_path.clone(),
            info: RwLock::new(FracInfo::new(base_path.to_string_lossy().into_owned())),
            caches,
            limiter,
            use_mu: RwLock::new(()),
            suicided: AtomicBool::new(false),
            load_mu: Mutex::new(()),
            loaded: RwLock::new(None),
            index_reader: Mutex::new(None),
            partial_suicide: AtomicU8::new(PartialSuicide::Off as u8),
        };

        match cached_info {
            Some(info) if info.index_on_disk > 0 => {
                *sealed.info.write().unwrap() = info;
            }
            _ => {
                let reader = sealed.open_index_reader()?;
                let info = read_header(&reader, &base_path)?;
                *sealed.info.write().unwrap() = info;
            }
        }

        Ok(Arc::new(sealed))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn info(&self) -> FracInfo {
        self.info.read().unwrap().clone()
    }

    pub fn set_partial_suicide(&self, mode: PartialSuicide) {
        self.partial_suicide.store(mode as u8, Ordering::Relaxed);
    }

    /// Seed the freshly-built token table after sealing, saving the first
    /// searcher a full table load.
    pub fn seed_token_table(&self, table: Arc<token::TokenTable>) {
        let size = table.size_bytes();
        self.caches.token_table.put(token::CACHE_KEY_TABLE, table, size);
    }

    fn open_index_reader(&self) -> Result<Arc<IndexReader>> {
        let mut slot = self.index_reader.lock().unwrap();
        if let Some(reader) = slot.as_ref() {
            return Ok(reader.clone());
        }
        let path = suffixed(&self.base_path, INDEX_SUFFIX);
        let file = Arc::new(LocalFile::open(&path)?);
        let reader = Arc::new(IndexReader::new(
            file,
            self.limiter.clone(),
            self.caches.registry.clone(),
        ));
        *slot = Some(reader.clone());
        Ok(reader)
    }

    fn load(&self) -> Result<Arc<LoadedState>> {
        if let Some(state) = self.loaded.read().unwrap().as_ref() {
            return Ok(state.clone());
        }

        let _load_guard = self.load_mu.lock().unwrap();
        if let Some(state) = self.loaded.read().unwrap().as_ref() {
            return Ok(state.clone());
        }

        let started = std::time::Instant::now();
        let index_reader = self.open_index_reader()?;

        let docs_path = suffixed(&self.base_path, DOCS_SUFFIX);
        let docs_file = match LocalFile::open(&docs_path) {
            Ok(file) => file,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                LocalFile::open(suffixed(&self.base_path, SDOCS_SUFFIX))?
            }
            Err(e) => return Err(e),
        };
        let docs_reader = DocsReader::new(
            Arc::new(docs_file),
            self.limiter.clone(),
            self.caches.docs.clone(),
        );

        let info = self.info();
        let state = loader::load(&index_reader, info.const_ids_per_block)?;

        let loaded = Arc::new(LoadedState {
            index_reader,
            docs_reader,
            state,
        });
        *self.loaded.write().unwrap() = Some(loaded.clone());

        tracing::info!(
            fraction = %info.name(),
            docs_total = info.docs_total,
            took_ms = started.elapsed().as_millis() as u64,
            "sealed fraction loaded"
        );
        Ok(loaded)
    }

    pub fn with_data_provider<R>(
        &self,
        f: impl FnOnce(&dyn DataProvider) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.use_mu.read().unwrap();
        if self.suicided.load(Ordering::Acquire) {
            return f(&EmptyDataProvider);
        }

        let loaded = self.load()?;
        let info = self.info();
        let provider = SealedDataProvider::new(&loaded, &self.caches, &info);
        f(&provider)
    }

    /// Upload `.docs`/`.sdocs` and `.index` to the remote store, then create
    /// the `.remote` sentinel. Only after the sentinel exists may the local
    /// files be suicided.
    pub async fn offload(&self, store: &dyn RemoteStore) -> Result<bool> {
        let docs_path = suffixed(&self.base_path, DOCS_SUFFIX);
        let docs_path = if docs_path.exists() {
            docs_path
        } else {
            suffixed(&self.base_path, SDOCS_SUFFIX)
        };
        let index_path = suffixed(&self.base_path, INDEX_SUFFIX);

        let (docs_res, index_res) =
            tokio::join!(store.upload(&docs_path), store.upload(&index_path));
        docs_res?;
        index_res?;

        let sentinel = suffixed(&self.base_path, REMOTE_SUFFIX);
        std::fs::File::create(&sentinel)?;
        sync_parent_dir(&sentinel)?;

        tracing::info!(fraction = %self.info().name(), "fraction offloaded to remote store");
        Ok(true)
    }

    /// Delete the fraction's files via the `.del` rename protocol. Any
    /// `.del` file left by a crash means "finish deleting on next startup".
    pub fn suicide(&self) {
        {
            let _guard = self.use_mu.write().unwrap();
            self.suicided.store(true, Ordering::Release);
        }

        self.caches.release();

        let mode = self.partial_suicide.load(Ordering::Relaxed);

        let docs = suffixed(&self.base_path, DOCS_SUFFIX);
        let docs_del = suffixed(&self.base_path, DOCS_DEL_SUFFIX);
        if let Err(e) = rename_if_exists(&docs, &docs_del) {
            tracing::error!(error = %e, file = %docs.display(), "can't rename docs file");
        }

        let sdocs = suffixed(&self.base_path, SDOCS_SUFFIX);
        let sdocs_del = suffixed(&self.base_path, SDOCS_DEL_SUFFIX);
        if let Err(e) = rename_if_exists(&sdocs, &sdocs_del) {
            tracing::error!(error = %e, file = %sdocs.display(), "can't rename sdocs file");
        }

        if mode == PartialSuicide::HalfRename as u8 {
            return;
        }

        let index = suffixed(&self.base_path, INDEX_SUFFIX);
        let index_del = suffixed(&self.base_path, INDEX_DEL_SUFFIX);
        if let Err(e) = std::fs::rename(&index, &index_del) {
            tracing::error!(error = %e, file = %index.display(), "can't rename index file");
        }

        if let Err(e) = remove_file_if_exists(&docs_del) {
            tracing::error!(error = %e, "can't remove docs file");
        }
        if let Err(e) = remove_file_if_exists(&sdocs_del) {
            tracing::error!(error = %e, "can't remove sdocs file");
        }

        if mode == PartialSuicide::HalfRemove as u8 {
            return;
        }

        if let Err(e) = remove_file_if_exists(&index_del) {
            tracing::error!(error = %e, "can't remove index file");
        }

        tracing::info!(fraction = %self.info().name(), "sealed fraction suicided");
    }
}

fn read_header(reader: &IndexReader, base_path: &Path) -> Result<FracInfo> {
    let payload = reader.read_block(0)?;
    let mut info = FracInfo::unpack(&payload)?;
    let index_path = suffixed(base_path, INDEX_SUFFIX);
    info.index_on_disk = std::fs::metadata(&index_path)?.len();
    // the cached path may come from another host's data dir
    info.path = base_path.to_string_lossy().into_owned();
    Ok(info)
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Search/fetch surface over one loaded sealed fraction. Also used by remote
/// fractions, which share the same on-disk layout.
pub struct SealedDataProvider<'a> {
    loaded: &'a LoadedState,
    ids: IdsProvider,
    lids_loader: LidsLoader,
    token_loader: TokenBlockLoader,
    table_loader: TokenTableLoader,
}

impl<'a> SealedDataProvider<'a> {
    pub(crate) fn new(loaded: &'a LoadedState, caches: &FracCaches, info: &FracInfo) -> Self {
        let state = &loaded.state;
        SealedDataProvider {
            loaded,
            ids: IdsProvider::new(
                state.ids_table.clone(),
                loaded.index_reader.clone(),
                info.binary_data_ver,
                caches.mids.clone(),
                caches.rids.clone(),
                caches.params.clone(),
            ),
            lids_loader: LidsLoader::new(
                loaded.index_reader.clone(),
                caches.lids.clone(),
                state.lids_table.start_block_index,
            ),
            token_loader: TokenBlockLoader::new(
                loaded.index_reader.clone(),
                caches.tokens.clone(),
            ),
            table_loader: TokenTableLoader::new(
                loaded.index_reader.clone(),
                caches.token_table.clone(),
                state.token_table_start,
            ),
        }
    }
}

impl FracSearchIndex for SealedDataProvider<'_> {
    fn ids_total(&self) -> u32 {
        self.loaded.state.ids_table.docs_total()
    }

    fn ordered_by_id(&self) -> bool {
        true
    }

    fn mid(&self, lid: Lid) -> Result<Mid> {
        self.ids.mid(lid)
    }

    fn rid(&self, lid: Lid) -> Result<Rid> {
        self.ids.rid(lid)
    }

    fn tids_by_expr(&self, ctx: &SearchContext, expr: &TokenExpr) -> Result<Vec<Tid>> {
        let table = self.table_loader.load()?;
        let entries = table.select_entries(expr.field.as_bytes(), &expr.term);
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let provider = SealedTokenProvider::new(&self.token_loader, entries);
        pattern::search(ctx, &provider, &expr.term)
    }

    fn lid_iters<'b>(
        &'b self,
        tids: &[Tid],
        min_lid: Lid,
        max_lid: Lid,
        reverse: bool,
    ) -> Result<Vec<Box<dyn LidIter + 'b>>> {
        Ok(tids
            .iter()
            .map(|&tid| {
                Box::new(LidsCursor::new(
                    &self.loaded.state.lids_table,
                    &self.lids_loader,
                    tid,
                    min_lid,
                    max_lid,
                    reverse,
                )) as Box<dyn LidIter + 'b>
            })
            .collect())
    }

    fn field_tokens(&self, ctx: &SearchContext, field: &str) -> Result<Vec<(Tid, Vec<u8>)>> {
        let table = self.table_loader.load()?;
        let Some(data) = table.fields.get(field.as_bytes()) else {
            return Ok(Vec::new());
        };
        let mut tokens = Vec::new();
        for entry in &data.entries {
            ctx.check()?;
            let block = self.token_loader.block(entry.block_index)?;
            for i in 0..entry.val_count {
                let tid = entry.start_tid + i;
                let value = block.token(entry.index_in_block(tid))?.to_vec();
                tokens.push((tid, value));
            }
        }
        Ok(tokens)
    }
}

impl FracFetchIndex for SealedDataProvider<'_> {
    fn find_lids(&self, _ctx: &SearchContext, ids: &[SeqId]) -> Result<Vec<Lid>> {
        self.ids.find_lids(ids)
    }

    fn doc_pos(&self, lid: Lid) -> Result<DocPos> {
        self.ids.doc_pos(lid)
    }

    fn read_docs(&self, block_index: u32, doc_offsets: &[u32]) -> Result<Vec<Vec<u8>>> {
        let block_offset = *self
            .loaded
            .state
            .blocks_offsets
            .get(block_index as usize)
            .ok_or_else(|| Error::corrupted("docs block index out of range"))?;
        self.loaded
            .docs_reader
            .read_docs(block_index, block_offset, doc_offsets)
    }
}

impl DataProvider for SealedDataProvider<'_> {
    fn search(&self, params: &SearchParams, ctx: &SearchContext) -> Result<Qpr> {
        search::search(self, params, ctx, 0)
    }

    fn fetch(&self, ids: &[SeqId], ctx: &SearchContext) -> Result<Vec<Vec<u8>>> {
        search::fetch(self, ids, ctx)
    }
}
