//! Active Fraction
//!
//! The write-optimized fraction. Appends arrive as pre-compressed
//! `(docs_block, meta_block)` pairs: the docs block is written first, the
//! meta block header is patched with the docs block's length (`ext1`) and
//! file offset (`ext2`), then the meta block is written. The call returns
//! once both writes are durable (or submitted to the page cache when
//! `skip_fsync` is set).
//!
//! Indexing runs behind the append: worker threads pull meta blocks off a
//! queue, decompress and parse them in parallel, and apply them to the
//! in-memory inverted index strictly in submission order: replay after a
//! crash therefore rebuilds the exact same state. `wait_idle` is the drain
//! barrier sealing and tests use.
//!
//! LIDs here are temporary (arrival order); they are finalized at sealing by
//! the `(MID, RID)`-descending sort. Searches against the active fraction
//! collect every match and sort afterwards.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard};

use seqdb_core::doc::{decode_meta_block, MetaData, Token};
use seqdb_core::query::TokenExpr;
use seqdb_core::{DocPos, Error, Lid, Mid, Qpr, Result, Rid, SeqId, Tid};
use seqdb_storage::block::{self, BlockHeader, BLOCK_HEADER_LEN};
use seqdb_storage::remote::LocalFile;
use seqdb_storage::{DocsReader, ReadLimiter};

use super::info::FracInfo;
use super::{
    rename_if_exists, sync_parent_dir, DataProvider, EmptyDataProvider, FracCaches,
    DOCS_DEL_SUFFIX, DOCS_SUFFIX, META_SUFFIX,
};
use crate::context::SearchContext;
use crate::pattern;
use crate::search::{
    self, FracFetchIndex, FracSearchIndex, LidIter, SearchParams, SliceLidIter,
};

/// In-memory inverted index of one active fraction.
#[derive(Default)]
pub struct ActiveIndexInner {
    token_tid: HashMap<Token, Tid>,
    /// tid-1 -> token
    tokens: Vec<Token>,
    field_tids: HashMap<Vec<u8>, Vec<Tid>>,
    /// tid-1 -> ascending LIDs
    postings: Vec<Vec<Lid>>,
    /// lid-1 -> id
    ids: Vec<SeqId>,
    /// lid-1 -> position in the docs file
    positions: Vec<DocPos>,
    id_to_lid: HashMap<SeqId, Lid>,
    /// docs-block index -> file offset
    blocks_offsets: Vec<u64>,
}

impl ActiveIndexInner {
    fn apply_meta_block(&mut self, block_index: u32, metas: &[MetaData]) {
        let mut doc_offset = 0u32;
        for meta in metas {
            let lid = self.ids.len() as Lid + 1;
            self.ids.push(meta.id);
            self.positions.push(DocPos::new(block_index, doc_offset));
            self.id_to_lid.insert(meta.id, lid);
            doc_offset += 4 + meta.size;

            for token in &meta.tokens {
                let tid = match self.token_tid.get(token) {
                    Some(&tid) => tid,
                    None => {
                        let tid = self.tokens.len() as Tid + 1;
                        self.token_tid.insert(token.clone(), tid);
                        self.tokens.push(token.clone());
                        self.postings.push(Vec::new());
                        self.field_tids
                            .entry(token.field.clone())
                            .or_default()
                            .push(tid);
                        tid
                    }
                };
                let posting = &mut self.postings[tid as usize - 1];
                // a document may emit the same token repeatedly
                if posting.last() != Some(&lid) {
                    posting.push(lid);
                }
            }
        }
    }

    pub fn docs_total(&self) -> u32 {
        self.ids.len() as u32
    }

    pub fn ids(&self) -> &[SeqId] {
        &self.ids
    }

    pub fn positions(&self) -> &[DocPos] {
        &self.positions
    }

    pub fn blocks_offsets(&self) -> &[u64] {
        &self.blocks_offsets
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn postings(&self) -> &[Vec<Lid>] {
        &self.postings
    }

    pub fn field_tids(&self) -> &HashMap<Vec<u8>, Vec<Tid>> {
        &self.field_tids
    }
}

struct ActiveShared {
    info: RwLock<FracInfo>,
    index: RwLock<ActiveIndexInner>,
    /// submitted-but-unapplied job count + next sequence to apply
    progress: Mutex<(usize, u64)>,
    cond: Condvar,
}

impl ActiveShared {
    /// Apply one parsed meta block in submission order.
    fn apply_in_order(&self, seq: u64, block_index: u32, metas: &[MetaData]) {
        let mut progress = self.progress.lock().unwrap();
        while progress.1 != seq {
            progress = self.cond.wait(progress).unwrap();
        }

        {
            let mut index = self.index.write().unwrap();
            index.apply_meta_block(block_index, metas);

            let mut info = self.info.write().unwrap();
            info.docs_total = index.docs_total();
            for meta in metas {
                info.observe_mid(meta.id.mid);
                info.docs_raw += 4 + meta.size as u64;
            }
        }

        progress.0 -= 1;
        progress.1 += 1;
        self.cond.notify_all();
    }
}

struct IndexJob {
    seq: u64,
    block_index: u32,
    meta_block: Vec<u8>,
}

struct ActiveWriter {
    docs: File,
    meta: File,
    docs_offset: u64,
    meta_offset: u64,
    next_seq: u64,
}

/// The open, appendable fraction.
pub struct Active {
    base_path: PathBuf,
    caches: FracCaches,
    shared: Arc<ActiveShared>,
    writer: Mutex<ActiveWriter>,
    docs_reader: DocsReader,
    job_tx: Mutex<Option<mpsc::Sender<IndexJob>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    use_mu: RwLock<()>,
    suicided: AtomicBool,
    sealed: AtomicBool,
    skip_fsync: bool,
}

impl Active {
    /// Open (or create) the active fraction at `base_path`. Call
    /// [`Active::replay`] before appending when the files may hold data from
    /// a previous run.
    pub fn open(
        base_path: impl Into<PathBuf>,
        limiter: Arc<ReadLimiter>,
        caches: FracCaches,
        indexer_workers: usize,
        skip_fsync: bool,
    ) -> Result<Arc<Active>> {
        let base_path = base_path.into();
        let docs_path = suffixed(&base_path, DOCS_SUFFIX);
        let meta_path = suffixed(&base_path, META_SUFFIX);

        let docs = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&docs_path)?;
        let meta = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&meta_path)?;
        let docs_offset = docs.metadata()?.len();
        let meta_offset = meta.metadata()?.len();

        let mut info = FracInfo::new(base_path.to_string_lossy().into_owned());
        info.docs_on_disk = docs_offset;
        info.meta_on_disk = meta_offset;

        let shared = Arc::new(ActiveShared {
            info: RwLock::new(info),
            index: RwLock::new(ActiveIndexInner::default()),
            progress: Mutex::new((0, 0)),
            cond: Condvar::new(),
        });

        let docs_reader = DocsReader::new(
            Arc::new(LocalFile::open(&docs_path)?),
            limiter,
            caches.docs.clone(),
        );

        let (tx, rx) = mpsc::channel::<IndexJob>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(indexer_workers.max(1));
        for worker_id in 0..indexer_workers.max(1) {
            let rx = rx.clone();
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("seqdb-indexer-{worker_id}"))
                    .spawn(move || indexer_loop(rx, shared))
                    .map_err(Error::Io)?,
            );
        }

        tracing::info!(fraction = %base_path.display(), "opened active fraction");

        Ok(Arc::new(Active {
            base_path,
            caches,
            shared,
            writer: Mutex::new(ActiveWriter {
                docs,
                meta,
                docs_offset,
                meta_offset,
                next_seq: 0,
            }),
            docs_reader,
            job_tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            use_mu: RwLock::new(()),
            suicided: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            skip_fsync,
        }))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn caches(&self) -> &FracCaches {
        &self.caches
    }

    pub fn info(&self) -> FracInfo {
        self.shared.info.read().unwrap().clone()
    }

    /// Append one `(docs_block, meta_block)` pair. Both must be complete
    /// blocks (33-byte header + payload). Returns after the writes are
    /// durable; indexing happens asynchronously.
    pub fn append(&self, docs: &[u8], mut metas: Vec<u8>) -> Result<()> {
        if self.suicided.load(Ordering::Acquire) {
            return Err(Error::Suicided);
        }
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::Sealed);
        }

        // reject torn blocks before they reach the files
        BlockHeader::decode(docs)?;
        if metas.len() < BLOCK_HEADER_LEN {
            return Err(Error::corrupted("meta block shorter than header"));
        }

        let (block_index, seq, docs_len, meta_len) = {
            let mut writer = self.writer.lock().unwrap();

            let docs_offset = writer.docs_offset;
            writer.docs.write_all(docs)?;
            writer.docs_offset += docs.len() as u64;

            block::set_exts(&mut metas, docs.len() as u64, docs_offset);
            writer.meta.write_all(&metas)?;
            writer.meta_offset += metas.len() as u64;

            if !self.skip_fsync {
                writer.docs.sync_data()?;
                writer.meta.sync_data()?;
            }

            let block_index = {
                let mut index = self.shared.index.write().unwrap();
                index.blocks_offsets.push(docs_offset);
                index.blocks_offsets.len() as u32 - 1
            };

            let seq = writer.next_seq;
            writer.next_seq += 1;
            (block_index, seq, docs.len() as u64, metas.len() as u64)
        };

        {
            let mut info = self.shared.info.write().unwrap();
            info.docs_on_disk += docs_len;
            info.meta_on_disk += meta_len;
        }

        {
            let mut progress = self.shared.progress.lock().unwrap();
            progress.0 += 1;
        }
        let tx = self.job_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                // receiver lives as long as the workers
                let _ = tx.send(IndexJob {
                    seq,
                    block_index,
                    meta_block: metas,
                });
            }
            None => {
                // the indexer stopped under us; undo the pending count so a
                // drain barrier cannot wait on a job that will never run
                let mut progress = self.shared.progress.lock().unwrap();
                progress.0 -= 1;
                self.shared.cond.notify_all();
            }
        }
        Ok(())
    }

    /// Block until the indexing queue is fully drained.
    pub fn wait_idle(&self) {
        let mut progress = self.shared.progress.lock().unwrap();
        while progress.0 > 0 {
            progress = self.shared.cond.wait(progress).unwrap();
        }
    }

    /// Rebuild the in-memory state from the `.meta` file. Incomplete
    /// trailing pairs (docs without meta, meta pointing past the docs file)
    /// are truncated away.
    pub fn replay(&self) -> Result<()> {
        let started = std::time::Instant::now();

        let meta_bytes = std::fs::read(suffixed(&self.base_path, META_SUFFIX))?;
        let docs_size = std::fs::metadata(suffixed(&self.base_path, DOCS_SUFFIX))?.len();

        let mut good_meta_end = 0u64;
        let mut good_docs_end = 0u64;
        let mut offset = 0usize;
        let mut blocks = 0u32;

        {
            let mut index = self.shared.index.write().unwrap();
            let mut info = self.shared.info.write().unwrap();

            while offset + BLOCK_HEADER_LEN <= meta_bytes.len() {
                let header = match BlockHeader::decode(&meta_bytes[offset..]) {
                    Ok(h) => h,
                    Err(_) => break,
                };
                let block_end = offset + header.full_len() as usize;
                if block_end > meta_bytes.len() {
                    break;
                }

                // ext1 = docs block length, ext2 = docs block offset
                let docs_end = header.ext2 + header.ext1;
                if docs_end > docs_size {
                    break;
                }

                let payload =
                    &meta_bytes[offset + BLOCK_HEADER_LEN..offset + BLOCK_HEADER_LEN + header.len as usize];
                let raw = match block::decompress_payload(&header, payload) {
                    Ok(raw) => raw,
                    Err(_) => break,
                };
                let metas = match decode_meta_block(&raw) {
                    Ok(metas) => metas,
                    Err(_) => break,
                };

                index.blocks_offsets.push(header.ext2);
                index.apply_meta_block(blocks, &metas);
                for meta in &metas {
                    info.observe_mid(meta.id.mid);
                    info.docs_raw += 4 + meta.size as u64;
                }
                info.docs_total = index.docs_total();

                blocks += 1;
                offset = block_end;
                good_meta_end = block_end as u64;
                good_docs_end = good_docs_end.max(docs_end);
            }

            info.docs_on_disk = good_docs_end;
            info.meta_on_disk = good_meta_end;
        }

        // drop incomplete trailing data
        if good_meta_end < meta_bytes.len() as u64 || good_docs_end < docs_size {
            let mut writer = self.writer.lock().unwrap();
            writer.meta.set_len(good_meta_end)?;
            writer.docs.set_len(good_docs_end)?;
            writer.meta_offset = good_meta_end;
            writer.docs_offset = good_docs_end;
            tracing::warn!(
                fraction = %self.base_path.display(),
                meta_end = good_meta_end,
                docs_end = good_docs_end,
                "truncated incomplete trailing append"
            );
        } else {
            let mut writer = self.writer.lock().unwrap();
            writer.meta_offset = good_meta_end;
            writer.docs_offset = good_docs_end;
        }

        let info = self.shared.info.read().unwrap();
        tracing::info!(
            fraction = %self.base_path.display(),
            docs_total = info.docs_total,
            blocks,
            took_ms = started.elapsed().as_millis() as u64,
            "active fraction replayed"
        );
        Ok(())
    }

    /// Refuse further appends; returns whether this call switched the flag.
    pub fn mark_sealed(&self) -> bool {
        !self.sealed.swap(true, Ordering::AcqRel)
    }

    pub fn is_suicided(&self) -> bool {
        self.suicided.load(Ordering::Acquire)
    }

    /// Stop the indexer workers (drains the queue first).
    pub fn stop(&self) {
        self.wait_idle();
        self.job_tx.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }

    pub fn suicide(&self) {
        // the write lock waits out in-flight readers
        {
            let _guard = self.use_mu.write().unwrap();
            self.suicided.store(true, Ordering::Release);
        }
        self.stop();
        self.caches.release();

        let docs = suffixed(&self.base_path, DOCS_SUFFIX);
        let docs_del = suffixed(&self.base_path, DOCS_DEL_SUFFIX);
        if let Err(e) = rename_if_exists(&docs, &docs_del) {
            tracing::error!(error = %e, file = %docs.display(), "can't rename docs file");
        }
        if let Err(e) = super::remove_file_if_exists(&suffixed(&self.base_path, META_SUFFIX)) {
            tracing::error!(error = %e, "can't remove meta file");
        }
        if let Err(e) = super::remove_file_if_exists(&docs_del) {
            tracing::error!(error = %e, "can't remove docs file");
        }
        let _ = sync_parent_dir(&self.base_path);

        tracing::info!(fraction = %self.base_path.display(), "active fraction suicided");
    }

    pub fn with_data_provider<R>(
        &self,
        f: impl FnOnce(&dyn DataProvider) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.use_mu.read().unwrap();
        if self.suicided.load(Ordering::Acquire) {
            return f(&EmptyDataProvider);
        }
        let provider = ActiveDataProvider {
            inner: self.shared.index.read().unwrap(),
            docs_reader: &self.docs_reader,
        };
        f(&provider)
    }

    /// Frozen view of the index for sealing. Callers must have stopped
    /// appends (`mark_sealed`) and drained the indexer (`wait_idle`).
    pub fn index_snapshot(&self) -> RwLockReadGuard<'_, ActiveIndexInner> {
        self.shared.index.read().unwrap()
    }
}

fn indexer_loop(rx: Arc<Mutex<mpsc::Receiver<IndexJob>>>, shared: Arc<ActiveShared>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };

        let parsed = block::decode_block(&job.meta_block)
            .and_then(|(_, raw)| decode_meta_block(&raw));

        match parsed {
            Ok(metas) => shared.apply_in_order(job.seq, job.block_index, &metas),
            Err(e) => {
                // the block was validated before the durable write; reaching
                // this point means in-flight memory corruption
                tracing::error!(error = %e, "dropping unparseable meta block");
                let mut progress = shared.progress.lock().unwrap();
                while progress.1 != job.seq {
                    progress = shared.cond.wait(progress).unwrap();
                }
                progress.0 -= 1;
                progress.1 += 1;
                shared.cond.notify_all();
            }
        }
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

// --- search/fetch over the in-memory index ---------------------------------

struct ActiveDataProvider<'a> {
    inner: RwLockReadGuard<'a, ActiveIndexInner>,
    docs_reader: &'a DocsReader,
}

struct ActiveTokenProvider<'a> {
    inner: &'a ActiveIndexInner,
    tids: &'a [Tid],
}

impl pattern::TokenProvider for ActiveTokenProvider<'_> {
    fn count(&self) -> usize {
        self.tids.len()
    }

    fn token_at(&self, pos: usize) -> Result<Vec<u8>> {
        Ok(self.inner.tokens[self.tids[pos] as usize - 1].value.clone())
    }

    fn tid_at(&self, pos: usize) -> Tid {
        self.tids[pos]
    }

    fn ordered(&self) -> bool {
        false
    }
}

impl FracSearchIndex for ActiveDataProvider<'_> {
    fn ids_total(&self) -> u32 {
        self.inner.ids.len() as u32
    }

    fn ordered_by_id(&self) -> bool {
        false
    }

    fn mid(&self, lid: Lid) -> Result<Mid> {
        Ok(self.inner.ids[lid as usize - 1].mid)
    }

    fn rid(&self, lid: Lid) -> Result<Rid> {
        Ok(self.inner.ids[lid as usize - 1].rid)
    }

    fn tids_by_expr(&self, ctx: &SearchContext, expr: &TokenExpr) -> Result<Vec<Tid>> {
        let Some(tids) = self.inner.field_tids.get(expr.field.as_bytes()) else {
            return Ok(Vec::new());
        };
        let provider = ActiveTokenProvider {
            inner: &self.inner,
            tids,
        };
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
                Box::new(SliceLidIter::new(
                    &self.inner.postings[tid as usize - 1],
                    min_lid,
                    max_lid,
                    reverse,
                )) as Box<dyn LidIter + 'b>
            })
            .collect())
    }

    fn field_tokens(&self, _ctx: &SearchContext, field: &str) -> Result<Vec<(Tid, Vec<u8>)>> {
        let Some(tids) = self.inner.field_tids.get(field.as_bytes()) else {
            return Ok(Vec::new());
        };
        Ok(tids
            .iter()
            .map(|&tid| (tid, self.inner.tokens[tid as usize - 1].value.clone()))
            .collect())
    }
}

impl FracFetchIndex for ActiveDataProvider<'_> {
    fn find_lids(&self, _ctx: &SearchContext, ids: &[SeqId]) -> Result<Vec<Lid>> {
        Ok(ids
            .iter()
            .map(|id| self.inner.id_to_lid.get(id).copied().unwrap_or(0))
            .collect())
    }

    fn doc_pos(&self, lid: Lid) -> Result<DocPos> {
        Ok(self.inner.positions[lid as usize - 1])
    }

    fn read_docs(&self, block_index: u32, doc_offsets: &[u32]) -> Result<Vec<Vec<u8>>> {
        let block_offset = *self
            .inner
            .blocks_offsets
            .get(block_index as usize)
            .ok_or_else(|| Error::corrupted("docs block index out of range"))?;
        self.docs_reader
            .read_docs(block_index, block_offset, doc_offsets)
    }
}

impl DataProvider for ActiveDataProvider<'_> {
    fn search(&self, params: &SearchParams, ctx: &SearchContext) -> Result<Qpr> {
        search::search(self, params, ctx, 0)
    }

    fn fetch(&self, ids: &[SeqId], ctx: &SearchContext) -> Result<Vec<Vec<u8>>> {
        search::fetch(self, ids, ctx)
    }
}
