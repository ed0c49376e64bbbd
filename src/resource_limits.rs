//! Resource limits: at most N ingestion runs at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum concurrent ingestion runs (default: 1, the audit artifact is per run)
    pub max_concurrent_runs: usize,

    /// Current active runs counter
    active_runs: Arc<AtomicUsize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ResourceLimits {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            max_concurrent_runs: max_concurrent_runs.max(1),
            active_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Try to acquire a run slot
    /// Returns Ok(RunGuard) if successful, Err if limit exceeded
    pub fn try_acquire_run(&self) -> Result<RunGuard, ResourceLimitError> {
        let current = self.active_runs.fetch_add(1, Ordering::SeqCst);

        if current >= self.max_concurrent_runs {
            self.active_runs.fetch_sub(1, Ordering::SeqCst);
            return Err(ResourceLimitError::RunInProgress {
                max: self.max_concurrent_runs,
            });
        }

        Ok(RunGuard {
            counter: self.active_runs.clone(),
        })
    }

    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }
}

/// RAII guard that decrements active run counter on drop
pub struct RunGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceLimitError {
    #[error("Another ingestion run is in progress (max {max})")]
    RunInProgress { max: usize },
}
