pub mod lance;
pub mod supabase;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::models::MatchResult;

pub use lance::LanceStore;
pub use supabase::SupabaseStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("LanceDB error: {0}")]
    Lance(#[from] lancedb::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Vector has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Store misconfigured: {0}")]
    Config(String),
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Row of the photos table without its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPhoto {
    pub id: String,
    pub photo_url: String,
}

/// Vector store holding one face embedding per photo.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert one record, returning the store-assigned id.
    async fn insert(&self, photo_url: &str, vector: &[f32]) -> Result<String>;

    /// Ranked matches with similarity >= `threshold`, at most `limit` rows.
    async fn match_faces(
        &self,
        query_embedding: &[f32],
        match_threshold: f32,
        match_limit: usize,
    ) -> Result<Vec<MatchResult>>;

    async fn list_photos(&self) -> Result<Vec<StoredPhoto>>;

    async fn health_check(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Open the configured backend. Failure here is fatal for the caller.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend {
        StoreBackend::Lance => {
            let store = LanceStore::new(&config.lance_path, &config.table, config.vector_dim).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Supabase => {
            let url = config
                .supabase_url
                .as_deref()
                .ok_or_else(|| StoreError::Config("SUPABASE_URL is not set".into()))?;
            let key = config
                .supabase_key
                .as_deref()
                .ok_or_else(|| StoreError::Config("SUPABASE_KEY is not set".into()))?;
            let store = SupabaseStore::new(url, key, &config.table)?;
            Ok(Arc::new(store))
        }
    }
}

/// Cosine similarity of two equal-length vectors, 0.0 for zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory store scoring with exact cosine similarity.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub rows: Mutex<Vec<(StoredPhoto, Vec<f32>)>>,
        pub reject_inserts: AtomicBool,
        pub reject_url_containing: Mutex<Option<String>>,
        next_id: AtomicUsize,
    }

    impl MemoryStore {
        pub(crate) fn rejecting() -> Self {
            let store = Self::default();
            store.reject_inserts.store(true, Ordering::SeqCst);
            store
        }

        pub(crate) fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VectorStore for MemoryStore {
        async fn insert(&self, photo_url: &str, vector: &[f32]) -> Result<String> {
            let reject_url = self.reject_url_containing.lock().unwrap().clone();
            if self.reject_inserts.load(Ordering::SeqCst)
                || reject_url.is_some_and(|needle| photo_url.contains(&needle))
            {
                return Err(StoreError::Rejected {
                    status: 503,
                    body: "store offline".into(),
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            self.rows.lock().unwrap().push((
                StoredPhoto {
                    id: id.clone(),
                    photo_url: photo_url.to_string(),
                },
                vector.to_vec(),
            ));
            Ok(id)
        }

        async fn match_faces(
            &self,
            query_embedding: &[f32],
            match_threshold: f32,
            match_limit: usize,
        ) -> Result<Vec<MatchResult>> {
            let mut matches: Vec<MatchResult> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .map(|(photo, v)| MatchResult {
                    id: photo.id.clone(),
                    photo_url: photo.photo_url.clone(),
                    similarity: cosine_similarity(query_embedding, v),
                })
                .filter(|m| m.similarity >= match_threshold)
                .collect();
            matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            matches.truncate(match_limit);
            Ok(matches)
        }

        async fn list_photos(&self) -> Result<Vec<StoredPhoto>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "memory"
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_supabase_backend_requires_credentials() {
        let config = StoreConfig {
            backend: StoreBackend::Supabase,
            supabase_url: None,
            supabase_key: Some("k".into()),
            ..StoreConfig::default()
        };
        let err = open_store(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::Config(msg) if msg.contains("SUPABASE_URL")));
    }

    #[tokio::test]
    async fn test_open_lance_backend() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            lance_path: temp.path().join("db").to_string_lossy().to_string(),
            vector_dim: 4,
            ..StoreConfig::default()
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.backend_name(), "lance");
        store.health_check().await.unwrap();
    }
}
