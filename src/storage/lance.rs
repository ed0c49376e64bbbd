use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::{
    connect,
    query::{ExecutableQuery, QueryBase, Select},
    Connection, DistanceType, Table,
};
use tokio::sync::RwLock;

use super::{Result, StoreError, StoredPhoto, VectorStore};
use crate::models::MatchResult;

/// Embedded LanceDB photo table, cosine distance.
pub struct LanceStore {
    db: Connection,
    table_name: String,
    table: RwLock<Option<Table>>,
    vector_dim: i32,
}

impl LanceStore {
    pub async fn new(db_path: &str, table_name: &str, vector_dim: usize) -> Result<Self> {
        std::fs::create_dir_all(db_path)?;

        let db = connect(db_path).execute().await?;

        let table_names = db.table_names().execute().await?;
        let table = if table_names.iter().any(|t| t == table_name) {
            Some(db.open_table(table_name).execute().await?)
        } else {
            None
        };

        tracing::info!(
            "LanceDB store opened at {} (table {}, {} dims, exists: {})",
            db_path,
            table_name,
            vector_dim,
            table.is_some()
        );

        Ok(Self {
            db,
            table_name: table_name.to_string(),
            table: RwLock::new(table),
            vector_dim: vector_dim as i32,
        })
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("photo_url", DataType::Utf8, false),
            Field::new("created_at", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.vector_dim,
                ),
                false,
            ),
        ]))
    }

    async fn current_table(&self) -> Option<Table> {
        self.table.read().await.clone()
    }

    pub async fn count(&self) -> Result<usize> {
        match self.current_table().await {
            Some(table) => Ok(table.count_rows(None).await?),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl VectorStore for LanceStore {
    async fn insert(&self, photo_url: &str, vector: &[f32]) -> Result<String> {
        if vector.len() != self.vector_dim as usize {
            return Err(StoreError::DimensionMismatch {
                expected: self.vector_dim as usize,
                got: vector.len(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let schema = self.schema();

        let ids: ArrayRef = Arc::new(StringArray::from(vec![id.as_str()]));
        let urls: ArrayRef = Arc::new(StringArray::from(vec![photo_url]));
        let created: ArrayRef = Arc::new(StringArray::from(vec![chrono::Utc::now().to_rfc3339()]));

        let values_array = Float32Array::from(vector.to_vec());
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vectors: ArrayRef = Arc::new(FixedSizeListArray::new(
            field,
            self.vector_dim,
            Arc::new(values_array),
            None,
        ));

        let batch = RecordBatch::try_new(schema.clone(), vec![ids, urls, created, vectors])?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());

        // Write lock so two first inserts cannot both create the table
        let mut guard = self.table.write().await;
        if let Some(table) = guard.as_ref() {
            table.add(Box::new(batches)).execute().await?;
        } else {
            let table = self
                .db
                .create_table(&self.table_name, Box::new(batches))
                .execute()
                .await?;
            *guard = Some(table);
        }

        Ok(id)
    }

    async fn match_faces(
        &self,
        query_embedding: &[f32],
        match_threshold: f32,
        match_limit: usize,
    ) -> Result<Vec<MatchResult>> {
        let Some(table) = self.current_table().await else {
            return Ok(Vec::new());
        };
        if query_embedding.len() != self.vector_dim as usize {
            return Err(StoreError::DimensionMismatch {
                expected: self.vector_dim as usize,
                got: query_embedding.len(),
            });
        }

        let results = table
            .query()
            .nearest_to(query_embedding)?
            .distance_type(DistanceType::Cosine)
            .limit(match_limit)
            .execute()
            .await?
            .try_collect::<Vec<_>>()
            .await?;

        let mut matches = Vec::new();
        for batch in results {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let urls = batch
                .column_by_name("photo_url")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

            if let (Some(ids), Some(urls), Some(distances)) = (ids, urls, distances) {
                for i in 0..batch.num_rows() {
                    // cosine distance = 1 - cosine similarity
                    let similarity = 1.0 - distances.value(i);
                    if similarity < match_threshold {
                        continue;
                    }
                    matches.push(MatchResult {
                        id: ids.value(i).to_string(),
                        photo_url: urls.value(i).to_string(),
                        similarity,
                    });
                }
            }
        }

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(match_limit);
        Ok(matches)
    }

    async fn list_photos(&self) -> Result<Vec<StoredPhoto>> {
        let Some(table) = self.current_table().await else {
            return Ok(Vec::new());
        };

        let results = table
            .query()
            .select(Select::Columns(vec!["id".to_string(), "photo_url".to_string()]))
            .execute()
            .await?
            .try_collect::<Vec<_>>()
            .await?;

        let mut photos = Vec::new();
        for batch in results {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let urls = batch
                .column_by_name("photo_url")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            if let (Some(ids), Some(urls)) = (ids, urls) {
                for i in 0..batch.num_rows() {
                    photos.push(StoredPhoto {
                        id: ids.value(i).to_string(),
                        photo_url: urls.value(i).to_string(),
                    });
                }
            }
        }
        Ok(photos)
    }

    async fn health_check(&self) -> Result<()> {
        let _ = self.count().await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "lance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_VECTOR_DIM: usize = 4;

    async fn create_test_store() -> (LanceStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("lance_test");
        let store = LanceStore::new(db_path.to_str().unwrap(), "photos", TEST_VECTOR_DIM)
            .await
            .unwrap();
        (store, temp_dir)
    }

    fn unit(v: [f32; 4]) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (store, _temp) = create_test_store().await;
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.list_photos().await.unwrap().is_empty());
        let matches = store
            .match_faces(&unit([1.0, 0.0, 0.0, 0.0]), 0.5, 10)
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_insert_assigns_unique_ids() {
        let (store, _temp) = create_test_store().await;
        let a = store.insert("https://a", &unit([1.0, 0.0, 0.0, 0.0])).await.unwrap();
        let b = store.insert("https://b", &unit([0.0, 1.0, 0.0, 0.0])).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count().await.unwrap(), 2);

        let mut urls: Vec<_> = store
            .list_photos()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.photo_url)
            .collect();
        urls.sort();
        assert_eq!(urls, vec!["https://a", "https://b"]);
    }

    #[tokio::test]
    async fn test_insert_rejects_wrong_dimension() {
        let (store, _temp) = create_test_store().await;
        let err = store.insert("https://a", &[1.0, 2.0]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 4,
                got: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_match_applies_threshold_and_order() {
        let (store, _temp) = create_test_store().await;
        store.insert("same", &unit([1.0, 0.0, 0.0, 0.0])).await.unwrap();
        store.insert("close", &unit([1.0, 0.2, 0.0, 0.0])).await.unwrap();
        store.insert("orthogonal", &unit([0.0, 1.0, 0.0, 0.0])).await.unwrap();
        store.insert("opposite", &unit([-1.0, 0.0, 0.0, 0.0])).await.unwrap();

        let matches = store
            .match_faces(&unit([1.0, 0.0, 0.0, 0.0]), 0.8, 10)
            .await
            .unwrap();

        let urls: Vec<_> = matches.iter().map(|m| m.photo_url.as_str()).collect();
        assert_eq!(urls, vec!["same", "close"]);
        assert!(matches[0].similarity > 0.99);
        assert!(matches.iter().all(|m| m.similarity >= 0.8));
    }

    #[tokio::test]
    async fn test_match_respects_limit() {
        let (store, _temp) = create_test_store().await;
        for i in 0..5 {
            store
                .insert(&format!("p{}", i), &unit([1.0, i as f32 * 0.01, 0.0, 0.0]))
                .await
                .unwrap();
        }
        let matches = store
            .match_faces(&unit([1.0, 0.0, 0.0, 0.0]), 0.0, 2)
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].photo_url, "p0");
    }

    #[tokio::test]
    async fn test_reopen_existing_table() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("lance_reopen");
        let path = db_path.to_str().unwrap();
        {
            let store = LanceStore::new(path, "photos", TEST_VECTOR_DIM).await.unwrap();
            store.insert("kept", &unit([0.0, 0.0, 1.0, 0.0])).await.unwrap();
        }
        let store = LanceStore::new(path, "photos", TEST_VECTOR_DIM).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schema_dimensions() {
        let (store, _temp) = create_test_store().await;
        let schema = store.schema();
        let vector_field = schema.field_with_name("vector").unwrap();
        if let DataType::FixedSizeList(_, size) = vector_field.data_type() {
            assert_eq!(*size, TEST_VECTOR_DIM as i32);
        } else {
            panic!("Expected FixedSizeList for vector field");
        }
    }
}
