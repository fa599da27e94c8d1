//! Async Search
//!
//! Long-running searches evaluated fraction-by-fraction by a bounded worker
//! pool. Progress (`fracs_done` / `fracs_in_queue`) and the partial QPR are
//! persisted as JSON under `<data_dir>/async_search/<id>.json` after every
//! fraction, so a search survives restarts with its partial result intact.
//!
//! Statuses merge across replicas by weight: `Done < InProgress < Canceled <
//! Error`: the heaviest wins, so a replica that errored taints the merged
//! view, and one still in progress outweighs finished peers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use seqdb_core::qpr::AsyncSearchStatus;
use seqdb_core::{Qpr, Result};

use crate::context::SearchContext;
use crate::frac::info::now_ms;
use crate::manager::FracManager;
use crate::search::SearchParams;

pub const ASYNC_SEARCH_DIR: &str = "async_search";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncSearchState {
    pub id: String,
    pub status: AsyncSearchStatus,
    pub fracs_done: usize,
    pub fracs_in_queue: usize,
    pub qpr: Qpr,
    pub created_at: u64,
    pub retention_ms: u64,
    pub params: SearchParams,
    #[serde(default)]
    pub error: Option<String>,
}

struct Entry {
    state: AsyncSearchState,
    ctx: SearchContext,
}

pub struct AsyncSearcher {
    dir: PathBuf,
    manager: Arc<FracManager>,
    pool: Arc<Semaphore>,
    searches: Mutex<HashMap<String, Entry>>,
}

impl AsyncSearcher {
    /// Create the searcher and recover persisted searches from disk.
    /// Searches interrupted by a restart keep their partial result and
    /// report `InProgress` until resubmitted or expired.
    pub fn new(manager: Arc<FracManager>, workers: usize) -> Result<Arc<AsyncSearcher>> {
        let dir = manager.config().data_dir.join(ASYNC_SEARCH_DIR);
        std::fs::create_dir_all(&dir)?;

        let mut searches = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            match serde_json::from_slice::<AsyncSearchState>(&bytes) {
                Ok(state) => {
                    searches.insert(
                        state.id.clone(),
                        Entry {
                            state,
                            ctx: SearchContext::new(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(file = %entry.path().display(), error = %e, "dropping unreadable async search");
                }
            }
        }
        if !searches.is_empty() {
            tracing::info!(count = searches.len(), "recovered async searches");
        }

        Ok(Arc::new(AsyncSearcher {
            dir,
            manager,
            pool: Arc::new(Semaphore::new(workers.max(1))),
            searches: Mutex::new(searches),
        }))
    }

    /// Submit a search; returns its id immediately.
    pub fn start(
        self: &Arc<Self>,
        params: SearchParams,
        retention: Duration,
    ) -> Result<String> {
        let id = ulid::Ulid::new().to_string();
        let ctx = SearchContext::new();
        let state = AsyncSearchState {
            id: id.clone(),
            status: AsyncSearchStatus::InProgress,
            fracs_done: 0,
            fracs_in_queue: 0,
            qpr: Qpr::default(),
            created_at: now_ms(),
            retention_ms: retention.as_millis() as u64,
            params: params.clone(),
            error: None,
        };
        self.persist(&state)?;
        self.searches.lock().unwrap().insert(
            id.clone(),
            Entry {
                state,
                ctx: ctx.clone(),
            },
        );

        let searcher = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            searcher.run(task_id, params, ctx).await;
        });
        Ok(id)
    }

    async fn run(self: Arc<Self>, id: String, params: SearchParams, ctx: SearchContext) {
        let _permit = match self.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let fracs: Vec<_> = self
            .manager
            .fracs()
            .into_iter()
            .filter(|frac| frac.is_intersecting(params.from, params.to))
            .collect();

        self.update(&id, |state| {
            state.fracs_in_queue = fracs.len();
        });

        for frac in fracs {
            if ctx.is_canceled() {
                self.update(&id, |state| state.status = AsyncSearchStatus::Canceled);
                return;
            }

            let params_frac = params.clone();
            let ctx_frac = ctx.clone();
            let result = tokio::task::spawn_blocking(move || {
                frac.with_data_provider(|dp| dp.search(&params_frac, &ctx_frac))
            })
            .await;

            match result {
                Ok(Ok(qpr)) => {
                    self.update(&id, |state| {
                        state.qpr.merge(qpr, params.limit, params.order);
                        state.fracs_done += 1;
                    });
                }
                Ok(Err(seqdb_core::Error::Canceled)) => {
                    self.update(&id, |state| state.status = AsyncSearchStatus::Canceled);
                    return;
                }
                Ok(Err(e)) => {
                    self.update(&id, |state| {
                        state.status = AsyncSearchStatus::Error;
                        state.error = Some(e.to_string());
                    });
                    return;
                }
                Err(e) => {
                    self.update(&id, |state| {
                        state.status = AsyncSearchStatus::Error;
                        state.error = Some(format!("search task failed: {e}"));
                    });
                    return;
                }
            }
        }

        self.update(&id, |state| state.status = AsyncSearchStatus::Done);
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut AsyncSearchState)) {
        let state = {
            let mut searches = self.searches.lock().unwrap();
            let Some(entry) = searches.get_mut(id) else {
                return;
            };
            apply(&mut entry.state);
            entry.state.clone()
        };
        if let Err(e) = self.persist(&state) {
            tracing::error!(search = %id, error = %e, "can't persist async search state");
        }
    }

    fn persist(&self, state: &AsyncSearchState) -> Result<()> {
        let path = self.dir.join(format!("{}.json", state.id));
        let tmp = self.dir.join(format!("{}.json.tmp", state.id));
        let payload = serde_json::to_vec(state)
            .map_err(|e| seqdb_core::Error::corrupted(format!("async state encode: {e}")))?;
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn status(&self, id: &str) -> Option<AsyncSearchState> {
        self.searches
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| entry.state.clone())
    }

    pub fn cancel(&self, id: &str) {
        let searches = self.searches.lock().unwrap();
        if let Some(entry) = searches.get(id) {
            entry.ctx.cancel();
        }
    }

    pub fn list(&self) -> Vec<AsyncSearchState> {
        self.searches
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.state.clone())
            .collect()
    }

    /// Drop searches whose retention has expired (state file included).
    pub fn sweep_expired(&self) {
        let now = now_ms();
        let expired: Vec<String> = {
            let searches = self.searches.lock().unwrap();
            searches
                .values()
                .filter(|entry| {
                    now.saturating_sub(entry.state.created_at) > entry.state.retention_ms
                })
                .map(|entry| entry.state.id.clone())
                .collect()
        };

        for id in expired {
            tracing::info!(search = %id, "removing expired async search");
            self.searches.lock().unwrap().remove(&id);
            let path = self.dir.join(format!("{id}.json"));
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(search = %id, error = %e, "can't remove async search file");
                }
            }
        }
    }
}

/// Merge the status of one search across replicas: the heaviest wins.
pub fn merge_statuses(statuses: &[AsyncSearchStatus]) -> Option<AsyncSearchStatus> {
    statuses.iter().copied().reduce(|a, b| a.merge(b))
}
