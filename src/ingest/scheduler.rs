//! Bounded worker pool over contiguous item groups.
//!
//! Groups run concurrently, items inside a group run one after another on the
//! same worker. Outcomes are streamed in completion order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::fetcher::{FetchError, Fetcher};
use crate::extract::{Extraction, FaceExtractor};
use crate::models::{FailureReason, ProcessingOutcome, SourceItem};

/// Turns one item into its terminal outcome.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &SourceItem) -> ProcessingOutcome;
}

/// fetch -> validate -> extract for one photo.
pub struct PhotoProcessor {
    fetcher: Fetcher,
    extractor: FaceExtractor,
}

impl PhotoProcessor {
    pub fn new(fetcher: Fetcher, extractor: FaceExtractor) -> Self {
        Self { fetcher, extractor }
    }
}

#[async_trait]
impl ItemProcessor for PhotoProcessor {
    async fn process(&self, item: &SourceItem) -> ProcessingOutcome {
        let failure = |reason: FailureReason| ProcessingOutcome::Failure {
            item: item.clone(),
            reason,
        };

        let mut asset = match self.fetcher.fetch(item).await {
            Ok(asset) => asset,
            Err(FetchError::InvalidSource) => {
                tracing::warn!("Invalid Google Drive URL: {}", item.locator);
                return failure(FailureReason::InvalidSourceReference);
            }
            Err(FetchError::InvalidAsset { .. }) => {
                tracing::warn!("Not a valid image: {}", item.locator);
                return failure(FailureReason::InvalidAsset);
            }
            Err(e) => {
                tracing::warn!("Download failed for {}: {}", item.locator, e);
                return failure(FailureReason::FetchExhausted);
            }
        };

        let result = self.extractor.extract(asset.take_bytes()).await;
        // staged file removed once extraction is done either way
        drop(asset);

        match result {
            Ok(Extraction::Face(vector)) => ProcessingOutcome::Success {
                item: item.clone(),
                vector,
            },
            Ok(Extraction::NoFace) => {
                tracing::warn!("No face detected: {}", item.locator);
                failure(FailureReason::NoFaceFound)
            }
            Err(e) => {
                tracing::error!("Face extraction failed for {}: {}", item.locator, e);
                failure(FailureReason::ExtractionError(e.to_string()))
            }
        }
    }
}

const MAX_OUTCOME_BUFFER: usize = 1024;

/// Split `items` into contiguous groups of `group_size` (last may be shorter).
pub fn partition(items: Vec<SourceItem>, group_size: usize) -> Vec<Vec<SourceItem>> {
    let group_size = group_size.max(1);
    let mut groups = Vec::with_capacity(items.len().div_ceil(group_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        groups.push(iter.by_ref().take(group_size).collect());
    }
    groups
}

/// Start processing and return the outcome stream. The stream closes after
/// exactly one outcome per input item has been sent.
pub fn run(
    items: Vec<SourceItem>,
    group_size: usize,
    worker_cap: usize,
    processor: Arc<dyn ItemProcessor>,
) -> mpsc::Receiver<ProcessingOutcome> {
    let worker_cap = worker_cap.max(1);
    // group_size comes from callers unchecked; never let it size the buffer
    let capacity = worker_cap
        .saturating_mul(group_size.min(items.len()).max(1))
        .min(MAX_OUTCOME_BUFFER);
    let groups = partition(items, group_size);
    let (tx, rx) = mpsc::channel::<ProcessingOutcome>(capacity);

    tracing::info!(
        "Scheduler: {} groups of up to {} items, {} workers",
        groups.len(),
        group_size.max(1),
        worker_cap
    );

    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(worker_cap));
        let mut workers = JoinSet::new();

        for (idx, group) in groups.into_iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let tx = tx.clone();
            let processor = processor.clone();
            workers.spawn(async move {
                let _permit = permit;
                supervise_group(idx, group, processor, tx).await;
            });
        }
        drop(tx);

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                tracing::error!("Scheduler: supervisor task failed: {}", e);
            }
        }
        tracing::debug!("Scheduler: all groups finished");
    });

    rx
}

/// Run one group on an inner task. If that task dies, every item it did not
/// report yet is reported as an extraction failure.
async fn supervise_group(
    idx: usize,
    group: Vec<SourceItem>,
    processor: Arc<dyn ItemProcessor>,
    tx: mpsc::Sender<ProcessingOutcome>,
) {
    let reported = Arc::new(AtomicUsize::new(0));
    let worker = {
        let group = group.clone();
        let tx = tx.clone();
        let reported = reported.clone();
        tokio::spawn(async move {
            for item in &group {
                let outcome = processor.process(item).await;
                if tx.send(outcome).await.is_err() {
                    tracing::warn!("Scheduler: outcome receiver dropped, stopping group");
                    return;
                }
                reported.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    if let Err(e) = worker.await {
        let done = reported.load(Ordering::SeqCst);
        tracing::error!(
            "Scheduler: worker for group {} died after {}/{} items: {}",
            idx,
            done,
            group.len(),
            e
        );
        for item in group.into_iter().skip(done) {
            let outcome = ProcessingOutcome::Failure {
                item,
                reason: FailureReason::ExtractionError(format!("worker task failed: {}", e)),
            };
            if tx.send(outcome).await.is_err() {
                break;
            }
        }
    }
}
