//! Similarity lookups and the merged photo listing.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::error_recovery::CircuitBreaker;
use crate::extract::{ExtractError, Extraction, FaceExtractor};
use crate::ingest::aggregator::load_audit;
use crate::ingest::validator;
use crate::models::{FeatureVector, MatchResult, PhotoEntry, PhotoStatus};
use crate::storage::{StoreError, VectorStore};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),
    #[error("limit must be at least 1")]
    InvalidLimit,
    #[error("Uploaded file is not a valid image")]
    InvalidImage,
    #[error("No face detected in the selfie")]
    NoFaceFound,
    #[error("Face extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Audit read failed: {0}")]
    Audit(#[from] std::io::Error),
}

pub fn validate_params(threshold: f32, limit: usize) -> Result<(), QueryError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(QueryError::InvalidThreshold(threshold));
    }
    if limit == 0 {
        return Err(QueryError::InvalidLimit);
    }
    Ok(())
}

/// Ranked matches for `vector`. Threshold and limit go to the store as-is;
/// the result is re-checked so no backend can leak rows outside them.
pub async fn find_matches(
    store: &dyn VectorStore,
    breaker: &CircuitBreaker,
    vector: &[f32],
    threshold: f32,
    limit: usize,
) -> Result<Vec<MatchResult>, QueryError> {
    validate_params(threshold, limit)?;

    let rows = breaker
        .call(|| store.match_faces(vector, threshold, limit))
        .await?;

    let mut matches: Vec<MatchResult> = rows
        .into_iter()
        .filter(|m| m.similarity >= threshold)
        .collect();
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    matches.truncate(limit);
    Ok(matches)
}

/// Embedding of the largest face in an uploaded image.
pub async fn selfie_embedding(
    extractor: &FaceExtractor,
    bytes: Vec<u8>,
) -> Result<FeatureVector, QueryError> {
    if !validator::validate(&bytes) {
        return Err(QueryError::InvalidImage);
    }
    match extractor.extract(bytes).await? {
        Extraction::Face(vector) => Ok(vector),
        Extraction::NoFace => Err(QueryError::NoFaceFound),
    }
}

/// Selfie lookup: extract, then search. No face is an error, never an empty
/// match list.
pub async fn find_by_selfie(
    extractor: &FaceExtractor,
    store: &dyn VectorStore,
    breaker: &CircuitBreaker,
    bytes: Vec<u8>,
    threshold: f32,
    limit: usize,
) -> Result<Vec<MatchResult>, QueryError> {
    validate_params(threshold, limit)?;
    let vector = selfie_embedding(extractor, bytes).await?;
    let matches = find_matches(store, breaker, &vector, threshold, limit).await?;
    tracing::info!(
        "Selfie query: {} matches (threshold {}, limit {})",
        matches.len(),
        threshold,
        limit
    );
    Ok(matches)
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoListing {
    pub processed_count: usize,
    pub failed_count: usize,
    pub photos: Vec<PhotoEntry>,
}

/// Stored photos followed by the failures of the last run's audit artifact.
pub async fn list_photos(
    store: &Arc<dyn VectorStore>,
    audit_path: &Path,
) -> Result<PhotoListing, QueryError> {
    let processed: Vec<PhotoEntry> = store
        .list_photos()
        .await?
        .into_iter()
        .map(|p| PhotoEntry {
            id: p.id,
            photo_url: p.photo_url,
            status: PhotoStatus::Processed,
            reason: None,
        })
        .collect();

    let failed: Vec<PhotoEntry> = load_audit(audit_path.to_path_buf())
        .await?
        .into_iter()
        .filter(|e| !e.success)
        .enumerate()
        .map(|(n, e)| PhotoEntry {
            id: format!("failed_{}", n),
            photo_url: e.url,
            status: PhotoStatus::Failed,
            reason: Some(e.error.unwrap_or_else(|| "Unknown error".to_string())),
        })
        .collect();

    let processed_count = processed.len();
    let failed_count = failed.len();
    let mut photos = processed;
    photos.extend(failed);

    Ok(PhotoListing {
        processed_count,
        failed_count,
        photos,
    })
}
