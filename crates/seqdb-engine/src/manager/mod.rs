//! Fraction Manager
//!
//! Owns the ordered fraction lists and drives the lifecycle:
//!
//! - **Rotation**: when the active fraction's docs file outgrows
//!   `frac_size`, a new ULID-named active is created and the previous one is
//!   handed to a background sealing task (single-flight per fraction).
//! - **Cleanup**: while the local fractions exceed `total_size`, the oldest
//!   is shifted out and either suicided or offloaded to the remote store and
//!   re-listed as a remote fraction.
//! - **Remote retention**: remote fractions older than the configured
//!   retention are deleted from the store.
//! - **Persistence**: fraction infos are mirrored into `.frac-cache` every
//!   maintenance pass; `.immature` marks a store that has never evicted.
//!
//! Reads never hold the fraction-list lock during I/O: search and fetch fan
//! out over a snapshot and run each fraction on a blocking thread.

pub mod frac_cache;
pub mod recovery;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use seqdb_core::qpr::ErrorSource;
use seqdb_core::{Error, Qpr, Result, SeqId};
use seqdb_storage::cache::CacheMaintainer;
use seqdb_storage::remote::RemoteStore;
use seqdb_storage::ReadLimiter;

use crate::config::EngineConfig;
use crate::context::SearchContext;
use crate::frac::active::Active;
use crate::frac::info::now_ms;
use crate::frac::remote::RemoteFrac;
use crate::frac::sealed::Sealed;
use crate::frac::{
    sealing, Frac, FracCaches, DOCS_SUFFIX, FILE_BASE_PATTERN, FRAC_CACHE_FILE, IMMATURE_FILE,
    META_SUFFIX,
};
use crate::search::SearchParams;
use frac_cache::FracCache;
use recovery::FracKind;

type FracSlot = Arc<RwLock<Frac>>;

struct ManagerState {
    /// Oldest-first; the active fraction is always the last slot.
    local: Vec<FracSlot>,
    remote: Vec<Arc<RemoteFrac>>,
    active: Option<(Arc<Active>, FracSlot)>,
}

pub struct FracManager {
    config: EngineConfig,
    maintainer: Arc<CacheMaintainer>,
    limiter: Arc<ReadLimiter>,
    store: Option<Arc<dyn RemoteStore>>,
    state: Mutex<ManagerState>,
    frac_cache: FracCache,
    inflight: Arc<Semaphore>,
    mature: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    loops: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl FracManager {
    pub fn new(config: EngineConfig, store: Option<Arc<dyn RemoteStore>>) -> Arc<FracManager> {
        let maintainer = CacheMaintainer::new(config.cache_size);
        let limiter = Arc::new(ReadLimiter::new(config.reader_workers));
        let frac_cache = FracCache::load(config.data_dir.join(FRAC_CACHE_FILE));
        let inflight = Arc::new(Semaphore::new(config.inflight_bulks));
        let (stop_tx, _) = watch::channel(false);

        Arc::new(FracManager {
            config,
            maintainer,
            limiter,
            store,
            state: Mutex::new(ManagerState {
                local: Vec::new(),
                remote: Vec::new(),
                active: None,
            }),
            frac_cache,
            inflight,
            mature: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
            loops: Mutex::new(Vec::new()),
            stop_tx,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache_maintainer(&self) -> &Arc<CacheMaintainer> {
        &self.maintainer
    }

    /// Discover existing fractions, finish interrupted deletions, replay
    /// actives, and make sure an active fraction exists.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;

        let offloading = self.config.offloading.is_some() && self.store.is_some();
        let mut scanned = recovery::scan(&self.config.data_dir)?;

        // finish interrupted suicides before classification
        scanned.retain(|frac| {
            if !frac.has_remote && frac.has_del_marker() {
                if let Err(e) = recovery::finish_deletion(frac) {
                    tracing::error!(error = %e, "failed to finish fraction deletion");
                }
                return false;
            }
            true
        });

        if self.config.frac_load_limit > 0 && scanned.len() > self.config.frac_load_limit {
            let skip = scanned.len() - self.config.frac_load_limit;
            tracing::info!(limit = self.config.frac_load_limit, skip, "applying fraction load limit");
            scanned.drain(..skip);
        }

        let mut actives: Vec<Arc<Active>> = Vec::new();
        let found_any = !scanned.is_empty();

        for frac in &scanned {
            let name = frac
                .base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let cached_info = self.frac_cache.get(&name);

            match recovery::classify(frac, offloading) {
                Some(FracKind::Remote) => {
                    let store = self.store.clone().expect("classify requires a store");
                    let remote = RemoteFrac::open(
                        &frac.base,
                        store,
                        self.limiter.clone(),
                        FracCaches::new(&self.maintainer),
                        cached_info,
                    )
                    .await?;
                    self.frac_cache.add(&name, remote.info());
                    self.state.lock().unwrap().remote.push(remote);
                }
                Some(FracKind::Sealed) => {
                    if frac.has_sdocs && frac.has_index {
                        // strays from an interrupted docs re-sort
                        crate::frac::remove_file_if_exists(&frac.base.with_file_name(
                            format!("{name}{META_SUFFIX}"),
                        ))?;
                        if frac.has_docs {
                            crate::frac::remove_file_if_exists(&frac.base.with_file_name(
                                format!("{name}{DOCS_SUFFIX}"),
                            ))?;
                        }
                    }
                    let sealed = Sealed::open(
                        &frac.base,
                        self.limiter.clone(),
                        FracCaches::new(&self.maintainer),
                        cached_info,
                    )?;
                    self.frac_cache.add(&name, sealed.info());
                    self.state
                        .lock()
                        .unwrap()
                        .local
                        .push(Arc::new(RwLock::new(Frac::Sealed(sealed))));
                }
                Some(FracKind::Active) => {
                    let active = Active::open(
                        &frac.base,
                        self.limiter.clone(),
                        FracCaches::new(&self.maintainer),
                        self.config.indexer_workers,
                        self.config.skip_fsync,
                    )?;
                    let frac_clone = active.clone();
                    tokio::task::spawn_blocking(move || frac_clone.replay())
                        .await
                        .map_err(|e| Error::corrupted(format!("replay task failed: {e}")))??;
                    actives.push(active);
                }
                None => {}
            }
        }

        // replayed actives: empty ones are suicided, all but the last are
        // sealed, the last becomes THE active
        let count = actives.len();
        for (i, active) in actives.into_iter().enumerate() {
            if active.info().docs_total == 0 {
                tokio::task::spawn_blocking(move || active.suicide())
                    .await
                    .ok();
                continue;
            }

            let slot = Arc::new(RwLock::new(Frac::Active(active.clone())));
            self.state.lock().unwrap().local.push(slot.clone());

            if i == count - 1 {
                self.state.lock().unwrap().active = Some((active, slot));
            } else {
                self.clone().seal_active(active, slot).await;
            }
        }

        if found_any {
            self.check_immature()?;
        } else {
            self.set_immature()?;
        }

        if self.state.lock().unwrap().active.is_none() {
            self.rotate()?;
        }
        Ok(())
    }

    /// Start the maintenance and cache-gc loops.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().unwrap();

        let manager = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.maintenance_delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.maintenance().await,
                    _ = stop_rx.changed() => return,
                }
            }
        }));

        let maintainer = self.maintainer.clone();
        let gc_delay = self.config.cache_gc_delay;
        let mut stop_rx = self.stop_tx.subscribe();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { maintainer.maintain(); }
                    _ = stop_rx.changed() => return,
                }
            }
        }));
    }

    /// Stop loops, drain background tasks, and seal the active fraction if
    /// it is worth sealing; otherwise it stays active for the next startup.
    pub async fn stop(self: &Arc<Self>) {
        let _ = self.stop_tx.send(true);

        let loops = std::mem::take(&mut *self.loops.lock().unwrap());
        for handle in loops {
            let _ = handle.await;
        }
        self.drain_tasks().await;

        let active = self.state.lock().unwrap().active.clone();
        if let Some((active, slot)) = active {
            let info = active.info();
            if info.full_size() > self.config.min_frac_size_to_seal() {
                tracing::info!(fraction = %info.name(), "sealing active fraction before exit");
                self.clone().seal_active(active, slot).await;
            } else {
                tracing::info!(fraction = %info.name(), "active fraction too small to seal on exit");
                let active = active.clone();
                tokio::task::spawn_blocking(move || active.stop()).await.ok();
            }
        }

        if let Err(e) = self.frac_cache.sync_to_disk() {
            tracing::error!(error = %e, "can't sync frac-cache on shutdown");
        }
    }

    async fn drain_tasks(&self) {
        let mut tasks = std::mem::replace(&mut *self.tasks.lock().unwrap(), JoinSet::new());
        while tasks.join_next().await.is_some() {}
    }

    /// Append one `(docs, metas)` block pair to the current active fraction,
    /// retrying across a concurrent rotation. Bounded by `inflight_bulks`.
    pub async fn append(&self, docs: Vec<u8>, metas: Vec<u8>) -> Result<()> {
        let _permit = self
            .inflight
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::TooManyInflight)?;

        let docs = Arc::new(docs);
        loop {
            let active = {
                let state = self.state.lock().unwrap();
                match &state.active {
                    Some((active, _)) => active.clone(),
                    None => return Err(Error::InvalidArgument("manager not loaded".to_string())),
                }
            };

            let docs = docs.clone();
            let metas_try = metas.clone();
            let result =
                tokio::task::spawn_blocking(move || active.append(&docs, metas_try))
                    .await
                    .map_err(|e| Error::corrupted(format!("append task failed: {e}")))?;

            match result {
                Ok(()) => return Ok(()),
                Err(Error::Sealed) | Err(Error::Suicided) => {
                    // raced with rotation; retry against the new active
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Snapshot of all fractions (local + remote), oldest-first.
    pub fn fracs(&self) -> Vec<Frac> {
        let state = self.state.lock().unwrap();
        let mut fracs: Vec<Frac> = state
            .local
            .iter()
            .map(|slot| slot.read().unwrap().clone())
            .collect();
        fracs.extend(state.remote.iter().cloned().map(Frac::Remote));
        fracs
    }

    pub fn active_info(&self) -> Option<crate::frac::info::FracInfo> {
        let state = self.state.lock().unwrap();
        state.active.as_ref().map(|(active, _)| active.info())
    }

    /// Fan a search out across every intersecting fraction and merge the
    /// partial results. Per-fraction failures become error sources in the
    /// merged result rather than failing the whole search.
    pub async fn search(&self, params: SearchParams, ctx: SearchContext) -> Result<Qpr> {
        let fracs: Vec<Frac> = self
            .fracs()
            .into_iter()
            .filter(|frac| frac.is_intersecting(params.from, params.to))
            .collect();

        let mut set: JoinSet<(u64, Result<Qpr>)> = JoinSet::new();
        for (i, frac) in fracs.into_iter().enumerate() {
            let params = params.clone();
            let ctx = ctx.clone();
            set.spawn_blocking(move || {
                let result = frac.with_data_provider(|dp| {
                    let mut qpr = dp.search(&params, &ctx)?;
                    let info = frac.info();
                    qpr.apply_hint(&info.name());
                    for id in &mut qpr.ids {
                        id.source = i as u64;
                    }
                    Ok(qpr)
                });
                (i as u64, result)
            });
        }

        let mut merged = Qpr::default();
        while let Some(joined) = set.join_next().await {
            let (source, result) =
                joined.map_err(|e| Error::corrupted(format!("search task failed: {e}")))?;
            match result {
                Ok(qpr) => merged.merge(qpr, params.limit, params.order),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(e) => merged.errors.push(ErrorSource {
                    err: e.to_string(),
                    source,
                }),
            }
        }
        Ok(merged)
    }

    /// Fetch documents by id across all fractions; the first fraction that
    /// holds an id wins. Missing ids yield empty payloads.
    pub async fn fetch(&self, ids: Vec<SeqId>, ctx: SearchContext) -> Result<Vec<Vec<u8>>> {
        let (min_mid, max_mid) = ids.iter().fold((u64::MAX, 0u64), |(lo, hi), id| {
            (lo.min(id.mid), hi.max(id.mid))
        });
        let fracs: Vec<Frac> = self
            .fracs()
            .into_iter()
            .filter(|frac| frac.is_intersecting(min_mid, max_mid))
            .collect();

        let ids = Arc::new(ids);
        let mut set: JoinSet<Result<Vec<Vec<u8>>>> = JoinSet::new();
        for frac in fracs {
            let ids = ids.clone();
            let ctx = ctx.clone();
            set.spawn_blocking(move || frac.with_data_provider(|dp| dp.fetch(&ids, &ctx)));
        }

        let mut merged = vec![Vec::new(); ids.len()];
        while let Some(joined) = set.join_next().await {
            let docs =
                joined.map_err(|e| Error::corrupted(format!("fetch task failed: {e}")))??;
            for (slot, doc) in merged.iter_mut().zip(docs) {
                if slot.is_empty() && !doc.is_empty() {
                    *slot = doc;
                }
            }
        }
        Ok(merged)
    }

    /// Block until the active fraction's indexing queue drains.
    pub async fn wait_idle(&self) {
        let active = self.state.lock().unwrap().active.clone();
        if let Some((active, _)) = active {
            tokio::task::spawn_blocking(move || active.wait_idle())
                .await
                .ok();
        }
    }

    pub fn mature(&self) -> bool {
        self.mature.load(Ordering::Relaxed)
    }

    // --- maintenance --------------------------------------------------------

    async fn maintenance(self: &Arc<Self>) {
        let rotate_needed = {
            let state = self.state.lock().unwrap();
            state
                .active
                .as_ref()
                .map(|(active, _)| active.info().docs_on_disk > self.config.frac_size)
                .unwrap_or(false)
        };

        if rotate_needed {
            match self.rotate() {
                Ok(Some((prev_active, prev_slot))) => {
                    let manager = self.clone();
                    self.tasks.lock().unwrap().spawn(async move {
                        manager.seal_active(prev_active, prev_slot).await;
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "rotation failed"),
            }
        }

        self.cleanup();
        self.remove_stale_remote();

        if let Err(e) = self.frac_cache.sync_to_disk() {
            tracing::error!(error = %e, "can't sync frac-cache");
        }
    }

    /// Create a fresh active fraction; returns the previous one.
    fn rotate(self: &Arc<Self>) -> Result<Option<(Arc<Active>, FracSlot)>> {
        let name = format!("{}{}", FILE_BASE_PATTERN, ulid::Ulid::new());
        let base_path: PathBuf = self.config.data_dir.join(&name);
        tracing::info!(fraction = %name, "creating new fraction");

        let active = Active::open(
            &base_path,
            self.limiter.clone(),
            FracCaches::new(&self.maintainer),
            self.config.indexer_workers,
            self.config.skip_fsync,
        )?;
        let slot = Arc::new(RwLock::new(Frac::Active(active.clone())));

        let mut state = self.state.lock().unwrap();
        let prev = state.active.replace((active, slot.clone()));
        state.local.push(slot);
        Ok(prev)
    }

    /// Seal one rotated-out active fraction, replacing it in its slot.
    async fn seal_active(self: Arc<Self>, active: Arc<Active>, slot: FracSlot) {
        if !active.mark_sealed() {
            return; // single-flight: another task owns this seal
        }

        let worker = active.clone();
        let params = self.config.seal.clone();
        let limiter = self.limiter.clone();
        let result = tokio::task::spawn_blocking(move || {
            worker.wait_idle();
            if worker.info().docs_total == 0 {
                return Ok(None);
            }
            let sealed = sealing::seal(&worker, &params, limiter)?;
            worker.stop();
            Ok(Some(sealed))
        })
        .await
        .unwrap_or_else(|e| Err(Error::corrupted(format!("seal task failed: {e}"))));

        match result {
            Ok(Some(sealed)) => {
                let info = sealed.info();
                self.frac_cache.add(&info.name(), info);
                *slot.write().unwrap() = Frac::Sealed(sealed);
            }
            Ok(None) => {
                // empty on shutdown or rotation: no data to keep
                self.remove_local_slot(&slot);
                tokio::task::spawn_blocking(move || active.suicide())
                    .await
                    .ok();
            }
            Err(Error::Suicided) => {
                self.remove_local_slot(&slot);
            }
            Err(e) => {
                tracing::error!(
                    fraction = %active.info().name(),
                    error = %e,
                    "sealing failed; fraction left unsealed for operator attention"
                );
            }
        }
    }

    fn remove_local_slot(&self, slot: &FracSlot) {
        let mut state = self.state.lock().unwrap();
        state.local.retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Shift oldest fractions out while the local total exceeds the budget,
    /// then suicide or offload each in the background.
    fn cleanup(self: &Arc<Self>) {
        let outsiders: Vec<FracSlot> = {
            let mut state = self.state.lock().unwrap();
            let mut total: u64 = state
                .local
                .iter()
                .map(|slot| slot.read().unwrap().info().full_size())
                .sum();

            let mut shifted = Vec::new();
            while total > self.config.total_size && state.local.len() > 1 {
                let slot = state.local.remove(0);
                total = total.saturating_sub(slot.read().unwrap().info().full_size());
                shifted.push(slot);
            }
            shifted
        };

        if outsiders.is_empty() {
            return;
        }
        if !self.mature() {
            if let Err(e) = self.set_mature() {
                tracing::error!(error = %e, "can't clear immature flag");
            }
        }

        for slot in outsiders {
            let manager = self.clone();
            self.tasks.lock().unwrap().spawn(async move {
                manager.evict_outsider(slot).await;
            });
        }
    }

    async fn evict_outsider(self: &Arc<Self>, slot: FracSlot) {
        let frac = slot.read().unwrap().clone();
        let info = frac.info();
        let name = info.name();

        let offloading = self.config.offloading.is_some() && self.store.is_some();
        if offloading {
            let store = self.store.clone().expect("checked above");
            let offload_start = std::time::Instant::now();
            match frac.offload(store.as_ref()).await {
                Ok(true) => {
                    tracing::info!(
                        fraction = %name,
                        took_ms = offload_start.elapsed().as_millis() as u64,
                        "fraction offloaded"
                    );
                    match RemoteFrac::open(
                        PathBuf::from(&info.path),
                        store,
                        self.limiter.clone(),
                        FracCaches::new(&self.maintainer),
                        Some(info.clone()),
                    )
                    .await
                    {
                        Ok(remote) => {
                            self.state.lock().unwrap().remote.push(remote);
                        }
                        Err(e) => {
                            tracing::error!(fraction = %name, error = %e, "can't open offloaded fraction");
                            self.frac_cache.remove(&name);
                        }
                    }
                    let frac = frac.clone();
                    tokio::task::spawn_blocking(move || frac.suicide()).await.ok();
                    return;
                }
                Ok(false) => {
                    // not offloadable (e.g. still active); fall through
                }
                Err(e) => {
                    tracing::error!(
                        fraction = %name,
                        error = %e,
                        "failed to offload fraction, deleting it instead"
                    );
                }
            }
        }

        self.frac_cache.remove(&name);
        tokio::task::spawn_blocking(move || frac.suicide()).await.ok();
    }

    /// Delete remote fractions past the offloading retention.
    fn remove_stale_remote(self: &Arc<Self>) {
        let retention = match &self.config.offloading {
            Some(offload) if !offload.retention.is_zero() => offload.retention,
            _ => return,
        };

        let now = now_ms();
        let stale: Vec<Arc<RemoteFrac>> = {
            let mut state = self.state.lock().unwrap();
            let (stale, fresh): (Vec<_>, Vec<_>) =
                state.remote.drain(..).partition(|remote| {
                    let age = now.saturating_sub(remote.info().creation_time);
                    age > retention.as_millis() as u64
                });
            state.remote = fresh;
            stale
        };

        for remote in stale {
            let info = remote.info();
            tracing::info!(
                fraction = %info.name(),
                retention_secs = retention.as_secs(),
                "removing stale remote fraction"
            );
            self.frac_cache.remove(&info.name());
            let manager = self.clone();
            self.tasks.lock().unwrap().spawn(async move {
                tokio::task::spawn_blocking(move || remote.suicide()).await.ok();
                drop(manager);
            });
        }
    }

    // --- maturity -----------------------------------------------------------

    fn immature_path(&self) -> PathBuf {
        self.config.data_dir.join(IMMATURE_FILE)
    }

    fn set_immature(&self) -> Result<()> {
        self.mature.store(false, Ordering::Relaxed);
        std::fs::File::create(self.immature_path())?;
        Ok(())
    }

    fn set_mature(&self) -> Result<()> {
        std::fs::remove_file(self.immature_path())?;
        self.mature.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn check_immature(&self) -> Result<()> {
        match std::fs::metadata(self.immature_path()) {
            Ok(_) => {
                self.mature.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.mature.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- test support -------------------------------------------------------

    /// Rotate and synchronously seal the previous active. Empty actives are
    /// suicided by the sealing path itself.
    pub async fn seal_forced(self: &Arc<Self>) {
        if let Ok(Some((active, slot))) = self.rotate() {
            self.clone().seal_active(active, slot).await;
        }
    }

    /// Run one maintenance pass and wait for the background work it spawned.
    pub async fn maintenance_forced(self: &Arc<Self>) {
        self.maintenance().await;
        self.drain_tasks().await;
    }
}
