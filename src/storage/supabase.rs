//! Supabase (PostgREST + pgvector) backend.
//!
//! Rows go to `/rest/v1/{table}`; similarity search calls the `match_faces`
//! database function through `/rest/v1/rpc/match_faces`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{Result, StoreError, StoredPhoto, VectorStore};
use crate::models::MatchResult;

pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
}

#[derive(Serialize)]
struct InsertRow<'a> {
    photo_url: &'a str,
    embedding: &'a [f32],
}

#[derive(Serialize)]
struct MatchRequest<'a> {
    query_embedding: &'a [f32],
    match_threshold: f32,
    match_limit: usize,
}

#[derive(Deserialize)]
struct PhotoRow {
    id: serde_json::Value,
    photo_url: String,
}

#[derive(Deserialize)]
struct MatchRow {
    id: serde_json::Value,
    photo_url: String,
    similarity: f32,
}

/// Ids may be serial integers or uuids depending on the table definition.
fn id_to_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SupabaseStore {
    pub fn new(url: &str, api_key: &str, table: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| StoreError::Config(format!("invalid Supabase URL {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StoreError::Config(format!(
                "Supabase URL must be http(s): {}",
                url
            )));
        }
        let key = api_key.trim();
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(key)
                .map_err(|_| StoreError::Config("invalid Supabase API key".into()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| StoreError::Config("invalid Supabase API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            table: table.to_string(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(StoreError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl VectorStore for SupabaseStore {
    async fn insert(&self, photo_url: &str, vector: &[f32]) -> Result<String> {
        let response = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .json(&InsertRow {
                photo_url,
                embedding: vector,
            })
            .send()
            .await?;

        let rows: Vec<PhotoRow> = Self::check(response).await?.json().await?;
        rows.first()
            .map(|row| id_to_string(&row.id))
            .ok_or_else(|| StoreError::Rejected {
                status: 200,
                body: "insert returned no rows".into(),
            })
    }

    async fn match_faces(
        &self,
        query_embedding: &[f32],
        match_threshold: f32,
        match_limit: usize,
    ) -> Result<Vec<MatchResult>> {
        let response = self
            .client
            .post(self.rpc_url("match_faces"))
            .json(&MatchRequest {
                query_embedding,
                match_threshold,
                match_limit,
            })
            .send()
            .await?;

        let rows: Vec<MatchRow> = Self::check(response).await?.json().await?;
        Ok(rows
            .into_iter()
            .map(|row| MatchResult {
                id: id_to_string(&row.id),
                photo_url: row.photo_url,
                similarity: row.similarity,
            })
            .collect())
    }

    async fn list_photos(&self) -> Result<Vec<StoredPhoto>> {
        let response = self
            .client
            .get(self.table_url())
            .query(&[("select", "id,photo_url")])
            .send()
            .await?;

        let rows: Vec<PhotoRow> = Self::check(response).await?.json().await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredPhoto {
                id: id_to_string(&row.id),
                photo_url: row.photo_url,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.table_url())
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "supabase"
    }
}
