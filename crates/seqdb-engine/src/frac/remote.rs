//! Remote Fraction
//!
//! A sealed fraction whose `.index` and `.docs`/`.sdocs` live in the remote
//! object store; only the zero-byte `<base>.remote` sentinel remains on
//! local disk. The logical surface and the on-disk layout are identical to
//! [`super::sealed::Sealed`]: the loader, tables and data provider are
//! reused verbatim over object-store-backed immutable files; every block
//! read goes through the same read limiter and caches.
//!
//! Suicide (driven by offloading retention) removes the local sentinel and
//! deletes the remote objects.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::runtime::Handle;

use seqdb_core::Result;
use seqdb_storage::remote::RemoteStore;
use seqdb_storage::{DocsReader, IndexReader, ReadLimiter};

use super::info::FracInfo;
use super::sealed::{loader, LoadedState, SealedDataProvider};
use super::{
    DataProvider, EmptyDataProvider, FracCaches, DOCS_SUFFIX, INDEX_SUFFIX, REMOTE_SUFFIX,
    SDOCS_SUFFIX,
};

pub struct RemoteFrac {
    base_path: PathBuf,
    name: String,
    info: RwLock<FracInfo>,
    caches: FracCaches,
    limiter: Arc<ReadLimiter>,
    store: Arc<dyn RemoteStore>,
    handle: Handle,
    use_mu: RwLock<()>,
    suicided: AtomicBool,
    load_mu: Mutex<()>,
    loaded: RwLock<Option<Arc<LoadedState>>>,
}

impl RemoteFrac {
    /// Open a remote fraction. Without a cached info the index header is
    /// fetched from the store right away.
    pub async fn open(
        base_path: impl Into<PathBuf>,
        store: Arc<dyn RemoteStore>,
        limiter: Arc<ReadLimiter>,
        caches: FracCaches,
        cached_info: Option<FracInfo>,
    ) -> Result<Arc<RemoteFrac>> {
        let base_path: PathBuf = base_path.into();
        let name = base_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let frac = RemoteFrac {
            base_path: base_path.clone(),
            name,
            info: RwLock::new(FracInfo::new(base_path.to_string_lossy().into_owned())),
            caches,
            limiter,
            store,
            handle: Handle::current(),
            use_mu: RwLock::new(()),
            suicided: AtomicBool::new(false),
            load_mu: Mutex::new(()),
            loaded: RwLock::new(None),
        };

        match cached_info {
            Some(info) if info.index_on_disk > 0 => {
                *frac.info.write().unwrap() = info;
            }
            _ => {
                let index_name = format!("{}{}", frac.name, INDEX_SUFFIX);
                let file = frac.store.reader(&index_name).await?;
                let limiter = frac.limiter.clone();
                let registry_cache = frac.caches.registry.clone();
                // remote reads block; keep them off the async workers
                let info = tokio::task::spawn_blocking(move || -> Result<FracInfo> {
                    let size = file.size()?;
                    let reader = IndexReader::new(file, limiter, registry_cache);
                    let mut info = FracInfo::unpack(&reader.read_block(0)?)?;
                    info.index_on_disk = size;
                    Ok(info)
                })
                .await
                .map_err(|e| seqdb_core::Error::corrupted(format!("load task failed: {e}")))??;

                let mut slot = frac.info.write().unwrap();
                let path = slot.path.clone();
                *slot = info;
                slot.path = path;
            }
        }

        Ok(Arc::new(frac))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn info(&self) -> FracInfo {
        self.info.read().unwrap().clone()
    }

    /// Load tables from the remote index. Runs on a blocking thread.
    fn load(&self) -> Result<Arc<LoadedState>> {
        if let Some(state) = self.loaded.read().unwrap().as_ref() {
            return Ok(state.clone());
        }

        let _load_guard = self.load_mu.lock().unwrap();
        if let Some(state) = self.loaded.read().unwrap().as_ref() {
            return Ok(state.clone());
        }

        let started = std::time::Instant::now();

        let index_name = format!("{}{}", self.name, INDEX_SUFFIX);
        let index_file = self
            .handle
            .block_on(self.store.reader(&index_name))?;
        let index_reader = Arc::new(IndexReader::new(
            index_file,
            self.limiter.clone(),
            self.caches.registry.clone(),
        ));

        let docs_name = format!("{}{}", self.name, DOCS_SUFFIX);
        let docs_file = if self.handle.block_on(self.store.exists(&docs_name))? {
            self.handle.block_on(self.store.reader(&docs_name))?
        } else {
            let sdocs_name = format!("{}{}", self.name, SDOCS_SUFFIX);
            self.handle.block_on(self.store.reader(&sdocs_name))?
        };
        let docs_reader = DocsReader::new(docs_file, self.limiter.clone(), self.caches.docs.clone());

        let info = self.info();
        let state = loader::load(&index_reader, info.const_ids_per_block)?;

        let loaded = Arc::new(LoadedState {
            index_reader,
            docs_reader,
            state,
        });
        *self.loaded.write().unwrap() = Some(loaded.clone());

        tracing::info!(
            fraction = %self.name,
            docs_total = info.docs_total,
            took_ms = started.elapsed().as_millis() as u64,
            "remote fraction loaded"
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

        let loaded = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                // remote availability problems must not fail the whole
                // search fan-out
                tracing::error!(
                    fraction = %self.name,
                    error = %e,
                    "cannot load remote fraction, serving empty provider"
                );
                return f(&EmptyDataProvider);
            }
        };
        let info = self.info();
        let provider = SealedDataProvider::new(&loaded, &self.caches, &info);
        f(&provider)
    }

    /// Remove the local sentinel and delete the remote objects.
    pub fn suicide(&self) {
        {
            let _guard = self.use_mu.write().unwrap();
            self.suicided.store(true, Ordering::Release);
        }

        self.caches.release();

        let sentinel = suffixed(&self.base_path, REMOTE_SUFFIX);
        if let Err(e) = super::remove_file_if_exists(&sentinel) {
            tracing::error!(error = %e, file = %sentinel.display(), "can't remove remote sentinel");
        }

        let names = vec![
            format!("{}{}", self.name, DOCS_SUFFIX),
            format!("{}{}", self.name, SDOCS_SUFFIX),
            format!("{}{}", self.name, INDEX_SUFFIX),
        ];
        let store = self.store.clone();
        let name = self.name.clone();
        self.handle.spawn(async move {
            if let Err(e) = store.remove(&names).await {
                tracing::warn!(fraction = %name, error = %e, "failed to delete remote objects");
            }
        });

        tracing::info!(fraction = %self.name, "remote fraction suicided");
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}
