use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use crate::config::PhotofinderConfig;
use crate::error_recovery::CircuitBreaker;
use crate::extract::{FaceAnalyzer, FaceExtractor, OnnxFaceAnalyzer};
use crate::ingest::fetcher::Transport;
use crate::ingest::{
    run_ingestion, Fetcher, HttpTransport, IngestError, ItemProcessor, Persister, PhotoProcessor,
    RunOptions,
};
use crate::metrics::ServiceMetrics;
use crate::models::{RunSummary, SourceItem};
use crate::resource_limits::ResourceLimits;
use crate::storage::{open_store, VectorStore};

/// Shared handles, built once at startup and read-only afterwards.
pub struct AppContext {
    pub config: PhotofinderConfig,
    pub extractor: FaceExtractor,
    pub store: Arc<dyn VectorStore>,
    pub processor: Arc<dyn ItemProcessor>,
    pub persister: Arc<Persister>,
    /// Guards every vector store call, ingestion and queries alike
    pub store_circuit: CircuitBreaker,
    pub metrics: Arc<ServiceMetrics>,
    pub limits: ResourceLimits,
    pub audit_path: PathBuf,
}

impl AppContext {
    /// Load models and open the store. Any failure here is fatal.
    pub async fn initialize(config: PhotofinderConfig) -> anyhow::Result<Self> {
        let dimension = config.store.vector_dim;
        let model_config = config.model.clone();
        let analyzer = tokio::task::spawn_blocking(move || {
            OnnxFaceAnalyzer::from_config(&model_config, dimension)
        })
        .await
        .context("face analyzer init task failed")?
        .context("failed to initialize face analyzer")?;

        let store = open_store(&config.store)
            .await
            .context("failed to open vector store")?;
        store
            .health_check()
            .await
            .with_context(|| format!("{} store is not reachable", store.backend_name()))?;

        let transport = HttpTransport::new(config.ingest.request_timeout())
            .context("failed to build HTTP client")?;

        Ok(Self::from_parts(
            config,
            Arc::new(analyzer),
            store,
            Arc::new(transport),
        ))
    }

    /// Assemble a context from already-built collaborators.
    pub fn from_parts(
        config: PhotofinderConfig,
        analyzer: Arc<dyn FaceAnalyzer>,
        store: Arc<dyn VectorStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let extractor = FaceExtractor::new(analyzer);
        let fetcher = Fetcher::new(
            transport,
            config.ingest.max_retries,
            config.ingest.retry_delay(),
        );
        let processor: Arc<dyn ItemProcessor> =
            Arc::new(PhotoProcessor::new(fetcher, extractor.clone()));
        let store_circuit = CircuitBreaker::for_store();
        let persister = Arc::new(Persister::new(store.clone(), store_circuit.clone()));
        let audit_path = PathBuf::from(&config.ingest.audit_path);
        tracing::info!(
            "Context ready: {}-d face embeddings, {} store, audit at {}",
            extractor.dimension(),
            store.backend_name(),
            audit_path.display()
        );

        Self {
            config,
            extractor,
            store,
            processor,
            persister,
            store_circuit,
            metrics: Arc::new(ServiceMetrics::new()),
            limits: ResourceLimits::default(),
            audit_path,
        }
    }

    /// One full ingestion run with the configured worker cap.
    pub async fn ingest(
        &self,
        items: Vec<SourceItem>,
        batch_size: usize,
    ) -> Result<RunSummary, IngestError> {
        let options = RunOptions {
            group_size: batch_size.max(1),
            worker_cap: self.config.ingest.effective_worker_cap(),
        };
        run_ingestion(
            items,
            options,
            self.processor.clone(),
            self.persister.clone(),
            &self.audit_path,
            Some(self.metrics.clone()),
        )
        .await
    }
}
