use std::sync::Arc;

use tokio::sync::mpsc;

use super::aggregator::{ResultAggregator, Ticket};
use crate::error_recovery::CircuitBreaker;
use crate::models::{FeatureVector, PersistedRecord, SourceItem};
use crate::storage::{StoreError, VectorStore};

/// Aggregator -> Persister
pub struct PersistJob {
    pub ticket: Ticket,
    pub item: SourceItem,
    pub vector: FeatureVector,
}

/// Writes successful extractions to the vector store.
pub struct Persister {
    store: Arc<dyn VectorStore>,
    breaker: CircuitBreaker,
}

impl Persister {
    pub fn new(store: Arc<dyn VectorStore>, breaker: CircuitBreaker) -> Self {
        Self { store, breaker }
    }

    pub async fn persist(
        &self,
        item: &SourceItem,
        vector: &[f32],
    ) -> Result<PersistedRecord, StoreError> {
        let store = self.store.clone();
        let id = self
            .breaker
            .call(|| async move { store.insert(&item.locator, vector).await })
            .await?;

        Ok(PersistedRecord {
            id,
            photo_url: item.locator.clone(),
            vector: vector.to_vec(),
        })
    }
}

/// Pipeline stage: drain jobs, demoting every record the store refuses.
/// Returns the number of records stored.
pub async fn persister_stage(
    persister: Arc<Persister>,
    mut rx: mpsc::Receiver<PersistJob>,
    aggregator: Arc<ResultAggregator>,
) -> usize {
    let mut stored = 0usize;
    while let Some(job) = rx.recv().await {
        match persister.persist(&job.item, &job.vector).await {
            Ok(record) => {
                aggregator.confirm(job.ticket);
                stored += 1;
                tracing::debug!("Stored {} as {}", record.photo_url, record.id);
            }
            Err(e) => {
                tracing::warn!("Failed to store {}: {}", job.item.locator, e);
                aggregator.demote(job.ticket, &e.to_string());
            }
        }
    }
    stored
}
