use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::source::extract_drive_id;

/// Face embedding produced for one photo.
pub type FeatureVector = Vec<f32>;

/// One remote photo as it enters the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// URL exactly as it appeared in the input list
    pub locator: String,
    /// Drive file id, `None` when the locator is not a recognised Drive link
    pub drive_id: Option<String>,
}

impl SourceItem {
    pub fn from_locator(locator: impl Into<String>) -> Self {
        let locator = locator.into();
        let drive_id = extract_drive_id(&locator);
        Self { locator, drive_id }
    }
}

/// Why an item did not end up in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    InvalidSourceReference,
    FetchExhausted,
    InvalidAsset,
    NoFaceFound,
    ExtractionError(String),
    InsertError(String),
}

impl FailureReason {
    /// Text written to the `error` field of the audit artifact.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidSourceReference => "Invalid Google Drive URL".to_string(),
            Self::FetchExhausted => "Failed to download photo".to_string(),
            Self::InvalidAsset => "Downloaded file is not a valid image".to_string(),
            Self::NoFaceFound => "No face detected".to_string(),
            Self::ExtractionError(msg) => format!("Face extraction failed: {}", msg),
            Self::InsertError(_) => "Failed to store photo".to_string(),
        }
    }

    /// Short machine-readable tag, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSourceReference => "invalid_source",
            Self::FetchExhausted => "fetch_exhausted",
            Self::InvalidAsset => "invalid_asset",
            Self::NoFaceFound => "no_face",
            Self::ExtractionError(_) => "extraction_error",
            Self::InsertError(_) => "insert_error",
        }
    }
}

/// Terminal result of processing one item. Produced once per item.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success {
        item: SourceItem,
        vector: FeatureVector,
    },
    Failure {
        item: SourceItem,
        reason: FailureReason,
    },
}

impl ProcessingOutcome {
    pub fn item(&self) -> &SourceItem {
        match self {
            Self::Success { item, .. } | Self::Failure { item, .. } => item,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A row written to the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: String,
    pub photo_url: String,
    pub vector: FeatureVector,
}

/// One element of the audit artifact (`processing_results.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub success: bool,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_error: Option<String>,
}

impl From<&ProcessingOutcome> for AuditEntry {
    fn from(outcome: &ProcessingOutcome) -> Self {
        match outcome {
            ProcessingOutcome::Success { item, vector } => Self {
                success: true,
                url: item.locator.clone(),
                drive_id: item.drive_id.clone(),
                embedding: Some(vector.clone()),
                error: None,
                insert_error: None,
            },
            ProcessingOutcome::Failure { item, reason } => Self {
                success: false,
                url: item.locator.clone(),
                drive_id: item.drive_id.clone(),
                embedding: None,
                error: Some(reason.message()),
                insert_error: match reason {
                    FailureReason::InsertError(msg) => Some(msg.clone()),
                    _ => None,
                },
            },
        }
    }
}

/// Totals for one ingestion run plus the audit trail in arrival order.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub entries: Vec<AuditEntry>,
}

impl RunSummary {
    /// Response body for the ingestion endpoint.
    pub fn report(&self) -> RunReport {
        RunReport {
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            elapsed_time: self.elapsed.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub elapsed_time: f64,
}

/// One candidate returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub id: String,
    pub photo_url: String,
    pub similarity: f32,
}

/// Row of the merged photo listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoEntry {
    pub id: String,
    pub photo_url: String,
    pub status: PhotoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    Processed,
    Failed,
}
