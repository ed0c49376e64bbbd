//! Run counters and the per-run audit trail.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::models::{AuditEntry, FailureReason, ProcessingOutcome, RunSummary};

/// Position of a recorded outcome in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(usize);

#[derive(Default)]
struct RunState {
    total: usize,
    successful: usize,
    failed: usize,
    entries: Vec<AuditEntry>,
    // successes not yet confirmed by the store
    unconfirmed: BTreeSet<usize>,
}

/// Collects outcomes from every worker. Counters and entries sit behind a
/// single lock so a demotion is never observed half-applied.
pub struct ResultAggregator {
    state: Mutex<RunState>,
    started: Instant,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        // Counter updates cannot panic midway, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, outcome: &ProcessingOutcome) -> Ticket {
        let mut state = self.lock();
        state.total += 1;
        if outcome.is_success() {
            state.successful += 1;
        } else {
            state.failed += 1;
        }
        if let ProcessingOutcome::Failure { item, reason } = outcome {
            tracing::debug!(kind = reason.kind(), "Failed: {}", item.locator);
        }
        state.entries.push(AuditEntry::from(outcome));
        let ticket = Ticket(state.entries.len() - 1);
        if outcome.is_success() {
            state.unconfirmed.insert(ticket.0);
        }

        if state.total % 50 == 0 {
            tracing::info!(
                "Progress: {} processed ({} ok, {} failed)",
                state.total,
                state.successful,
                state.failed
            );
        }
        ticket
    }

    /// Turn a recorded success into an insert failure. No-op if the entry is
    /// not (or no longer) a success.
    pub fn demote(&self, ticket: Ticket, insert_error: &str) -> bool {
        let mut state = self.lock();
        Self::demote_locked(&mut state, ticket.0, insert_error)
    }

    /// Mark a recorded success as stored.
    pub fn confirm(&self, ticket: Ticket) {
        self.lock().unconfirmed.remove(&ticket.0);
    }

    /// Demote every success the store never confirmed. Returns how many.
    pub fn demote_unconfirmed(&self, insert_error: &str) -> usize {
        let mut state = self.lock();
        let pending: Vec<usize> = state.unconfirmed.iter().copied().collect();
        pending
            .into_iter()
            .filter(|idx| Self::demote_locked(&mut state, *idx, insert_error))
            .count()
    }

    fn demote_locked(state: &mut RunState, idx: usize, insert_error: &str) -> bool {
        state.unconfirmed.remove(&idx);
        let Some(entry) = state.entries.get_mut(idx) else {
            return false;
        };
        if !entry.success {
            return false;
        }

        let reason = FailureReason::InsertError(insert_error.to_string());
        entry.success = false;
        entry.embedding = None;
        entry.error = Some(reason.message());
        entry.insert_error = Some(insert_error.to_string());

        state.successful -= 1;
        state.failed += 1;
        true
    }

    /// Counters so far as `(total, successful, failed)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (state.total, state.successful, state.failed)
    }

    /// Close the run: snapshot counters and entries, then overwrite the audit
    /// artifact at `path`.
    pub async fn finalize(&self, path: &Path) -> std::io::Result<RunSummary> {
        let summary = {
            let state = self.lock();
            RunSummary {
                total: state.total,
                successful: state.successful,
                failed: state.failed,
                elapsed: self.started.elapsed(),
                entries: state.entries.clone(),
            }
        };
        let path = path.to_path_buf();
        let entries = summary.entries.clone();
        tokio::task::spawn_blocking(move || write_audit(&path, &entries))
            .await
            .map_err(std::io::Error::other)??;
        Ok(summary)
    }
}

/// Write the audit array to a sibling temp file, then rename it into place.
pub fn write_audit(path: &Path, entries: &[AuditEntry]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let json = serde_json::to_vec_pretty(entries).map_err(std::io::Error::other)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a previously written audit artifact. Missing file yields no entries.
pub fn read_audit(path: &Path) -> std::io::Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read(path)?;
    serde_json::from_slice(&content).map_err(std::io::Error::other)
}

/// [`read_audit`] off the async worker threads.
pub async fn load_audit(path: PathBuf) -> std::io::Result<Vec<AuditEntry>> {
    tokio::task::spawn_blocking(move || read_audit(&path))
        .await
        .map_err(std::io::Error::other)?
}
