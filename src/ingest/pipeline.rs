//! Ingestion run: Scheduler -> Aggregator -> Persister.
//!
//! Outcomes stream out of the scheduler into a single aggregation point;
//! provisional successes are handed to the persister stage over a bounded
//! channel and demoted there if the store refuses them.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::aggregator::ResultAggregator;
use super::persister::{persister_stage, PersistJob, Persister};
use super::scheduler::{self, ItemProcessor};
use super::IngestError;
use crate::metrics::ServiceMetrics;
use crate::models::{ProcessingOutcome, RunSummary, SourceItem};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub group_size: usize,
    pub worker_cap: usize,
}

/// Process every item, persist successes, write the audit artifact and
/// return the finalized summary.
pub async fn run_ingestion(
    items: Vec<SourceItem>,
    options: RunOptions,
    processor: Arc<dyn ItemProcessor>,
    persister: Arc<Persister>,
    audit_path: &Path,
    metrics: Option<Arc<ServiceMetrics>>,
) -> Result<RunSummary, IngestError> {
    let expected = items.len();
    tracing::info!(
        "Ingestion: {} items, batch size {}, {} workers",
        expected,
        options.group_size,
        options.worker_cap
    );

    let aggregator = Arc::new(ResultAggregator::new());
    let (persist_tx, persist_rx) = mpsc::channel::<PersistJob>(64);

    let h_persister = tokio::spawn(persister_stage(
        persister,
        persist_rx,
        aggregator.clone(),
    ));

    let mut outcomes = scheduler::run(items, options.group_size, options.worker_cap, processor);
    while let Some(outcome) = outcomes.recv().await {
        let ticket = aggregator.record(&outcome);
        if let ProcessingOutcome::Success { item, vector } = outcome {
            let job = PersistJob {
                ticket,
                item,
                vector,
            };
            if persist_tx.send(job).await.is_err() {
                // persister gone: nothing can be stored any more
                aggregator.demote(ticket, "persister stage stopped");
            }
        }
    }
    drop(persist_tx);

    let stored = match h_persister.await {
        Ok(n) => n,
        Err(e) => {
            // keep the run: whatever the store never confirmed counts as failed
            let demoted = aggregator.demote_unconfirmed(&format!("persister stage failed: {}", e));
            tracing::error!(
                "Ingestion: persister stage died ({}), {} unconfirmed records demoted",
                e,
                demoted
            );
            0
        }
    };

    let summary = aggregator.finalize(audit_path).await?;
    if summary.total != expected {
        tracing::error!(
            "Ingestion: {} outcomes for {} items",
            summary.total,
            expected
        );
    }

    if let Some(m) = metrics {
        m.record_run(
            summary.successful,
            summary.failed,
            summary.elapsed.as_millis() as usize,
        );
    }

    tracing::info!(
        "Ingestion complete: {} total, {} successful ({} stored), {} failed in {:.1}s",
        summary.total,
        summary.successful,
        stored,
        summary.failed,
        summary.elapsed.as_secs_f64()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::error_recovery::CircuitBreaker;
    use crate::extract::tests::{face, FixedAnalyzer};
    use crate::extract::FaceExtractor;
    use crate::ingest::aggregator::read_audit;
    use crate::ingest::fetcher::tests::{Scripted, ScriptedTransport};
    use crate::ingest::fetcher::Fetcher;
    use crate::ingest::scheduler::PhotoProcessor;
    use crate::ingest::source::{candidate_urls, parse_url_list};
    use crate::ingest::validator::png_bytes;
    use crate::models::MatchResult;
    use crate::storage::tests::MemoryStore;
    use crate::storage::{StoreError, StoredPhoto, VectorStore};

    /// A: one face (width 8), B: no face (width 6), C: unreachable.
    fn example_processor() -> Arc<PhotoProcessor> {
        let transport = ScriptedTransport::default()
            .on(&candidate_urls("A")[0], vec![Scripted::Ok(png_bytes(8, 8))])
            .on(&candidate_urls("B")[0], vec![Scripted::Ok(png_bytes(6, 6))]);
        let fetcher = Fetcher::new(Arc::new(transport), 3, Duration::ZERO);

        let mut faces = HashMap::new();
        faces.insert(8, vec![face(0.0, 0.0, 4.0, 4.0, 0.5)]);
        let extractor = FaceExtractor::new(Arc::new(FixedAnalyzer {
            faces_by_width: faces,
            fail_width: None,
        }));
        Arc::new(PhotoProcessor::new(fetcher, extractor))
    }

    fn example_items() -> Vec<SourceItem> {
        parse_url_list(
            "https://drive.google.com/file/d/A/view\n\
             https://drive.google.com/file/d/B/view\n\
             https://drive.google.com/file/d/C/view\n",
        )
    }

    const OPTIONS: RunOptions = RunOptions {
        group_size: 2,
        worker_cap: 2,
    };

    #[tokio::test]
    async fn test_example_run() {
        let temp = TempDir::new().unwrap();
        let audit = temp.path().join("processing_results.json");
        let store = Arc::new(MemoryStore::default());
        let persister = Arc::new(Persister::new(store.clone(), CircuitBreaker::for_store()));
        let metrics = Arc::new(ServiceMetrics::new());

        let summary = run_ingestion(
            example_items(),
            OPTIONS,
            example_processor(),
            persister,
            &audit,
            Some(metrics.clone()),
        )
        .await
        .unwrap();

        assert_eq!((summary.total, summary.successful, summary.failed), (3, 1, 2));
        assert_eq!(store.len(), 1);
        assert_eq!(metrics.items_processed.load(Ordering::Relaxed), 3);

        let entries = read_audit(&audit).unwrap();
        let by_url: HashMap<_, _> = entries.iter().map(|e| (e.drive_id.clone().unwrap(), e)).collect();
        assert!(by_url["A"].success);
        assert_eq!(by_url["A"].embedding, Some(vec![0.5, 0.5]));
        assert_eq!(by_url["B"].error.as_deref(), Some("No face detected"));
        assert_eq!(by_url["C"].error.as_deref(), Some("Failed to download photo"));
    }

    #[tokio::test]
    async fn test_rejecting_store_keeps_totals() {
        let temp = TempDir::new().unwrap();
        let audit = temp.path().join("processing_results.json");
        let store = Arc::new(MemoryStore::rejecting());
        let persister = Arc::new(Persister::new(store.clone(), CircuitBreaker::for_store()));

        let summary = run_ingestion(
            example_items(),
            OPTIONS,
            example_processor(),
            persister,
            &audit,
            None,
        )
        .await
        .unwrap();

        assert_eq!((summary.total, summary.successful, summary.failed), (3, 0, 3));
        assert_eq!(store.len(), 0);

        let entries = read_audit(&audit).unwrap();
        let a = entries
            .iter()
            .find(|e| e.drive_id.as_deref() == Some("A"))
            .unwrap();
        assert_eq!(a.error.as_deref(), Some("Failed to store photo"));
        assert!(a.insert_error.as_deref().unwrap().contains("store offline"));
        // Other failures carry no insert error
        assert!(entries
            .iter()
            .filter(|e| e.drive_id.as_deref() != Some("A"))
            .all(|e| e.insert_error.is_none()));
    }

    /// Panics on every insert.
    struct PanickingStore;

    #[async_trait::async_trait]
    impl VectorStore for PanickingStore {
        async fn insert(&self, photo_url: &str, _vector: &[f32]) -> Result<String, StoreError> {
            panic!("insert blew up for {}", photo_url);
        }

        async fn match_faces(
            &self,
            _query_embedding: &[f32],
            _match_threshold: f32,
            _match_limit: usize,
        ) -> Result<Vec<MatchResult>, StoreError> {
            Ok(Vec::new())
        }

        async fn list_photos(&self) -> Result<Vec<StoredPhoto>, StoreError> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_dead_persister_still_writes_audit() {
        let temp = TempDir::new().unwrap();
        let audit = temp.path().join("processing_results.json");
        let persister = Arc::new(Persister::new(
            Arc::new(PanickingStore),
            CircuitBreaker::for_store(),
        ));

        let summary = run_ingestion(
            example_items(),
            OPTIONS,
            example_processor(),
            persister,
            &audit,
            None,
        )
        .await
        .unwrap();

        assert_eq!((summary.total, summary.successful, summary.failed), (3, 0, 3));

        let entries = read_audit(&audit).unwrap();
        assert_eq!(entries.len(), 3);
        let a = entries
            .iter()
            .find(|e| e.drive_id.as_deref() == Some("A"))
            .unwrap();
        assert!(!a.success);
        assert!(a.embedding.is_none());
        assert_eq!(a.error.as_deref(), Some("Failed to store photo"));
        assert!(a.insert_error.as_deref().unwrap().starts_with("persister stage"));
    }

    #[tokio::test]
    async fn test_invalid_locators_are_counted() {
        let temp = TempDir::new().unwrap();
        let audit = temp.path().join("out.json");
        let store = Arc::new(MemoryStore::default());
        let persister = Arc::new(Persister::new(store, CircuitBreaker::for_store()));

        let items = parse_url_list("https://example.com/x.jpg\nnot-a-url\n");
        let summary = run_ingestion(
            items,
            OPTIONS,
            example_processor(),
            persister,
            &audit,
            None,
        )
        .await
        .unwrap();

        assert_eq!((summary.total, summary.failed), (2, 2));
        assert!(summary
            .entries
            .iter()
            .all(|e| e.error.as_deref() == Some("Invalid Google Drive URL")));
    }

    #[tokio::test]
    async fn test_empty_run_writes_empty_audit() {
        let temp = TempDir::new().unwrap();
        let audit = temp.path().join("out.json");
        let persister = Arc::new(Persister::new(
            Arc::new(MemoryStore::default()),
            CircuitBreaker::for_store(),
        ));

        let summary = run_ingestion(
            Vec::new(),
            OPTIONS,
            example_processor(),
            persister,
            &audit,
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.total, 0);
        assert!(read_audit(&audit).unwrap().is_empty());
    }
}
