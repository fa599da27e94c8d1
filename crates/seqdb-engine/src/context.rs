//! Search Context
//!
//! Cancellation and deadline propagation for search and fetch. The whole
//! read path is synchronous (bounded by the read limiter), so the context is
//! a plain token checked at every block boundary and iterator step. A
//! canceled search returns `Canceled`, never partial results presented as
//! complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use seqdb_core::{Error, Result};

#[derive(Clone, Default)]
pub struct SearchContext {
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl SearchContext {
    pub fn new() -> Self {
        SearchContext::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        SearchContext {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    /// Check at block boundaries and iterator steps.
    pub fn check(&self) -> Result<()> {
        if self.canceled.load(Ordering::Relaxed) {
            return Err(Error::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}
