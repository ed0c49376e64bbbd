use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// photofinder configuration from config.toml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct PhotofinderConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Items per worker group
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent worker groups (defaults to available parallelism)
    #[serde(default)]
    pub worker_cap: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Where the per-run audit artifact is written
    #[serde(default = "default_audit_path")]
    pub audit_path: String,
}

fn default_batch_size() -> usize {
    10
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_audit_path() -> String {
    "processing_results.json".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            worker_cap: None,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            audit_path: default_audit_path(),
        }
    }
}

impl IngestConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Worker cap, falling back to the number of execution units.
    pub fn effective_worker_cap(&self) -> usize {
        self.worker_cap
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
            .max(1)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Lance,
    Supabase,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// LanceDB directory (lance backend)
    #[serde(default = "default_lance_path")]
    pub lance_path: String,
    /// Project URL (supabase backend), overridden by SUPABASE_URL
    #[serde(default)]
    pub supabase_url: Option<String>,
    /// API key (supabase backend), overridden by SUPABASE_KEY
    #[serde(default)]
    pub supabase_key: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    /// Embedding dimension of the face recognizer
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Lance
}
fn default_lance_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photofinder")
        .join("lance")
        .to_string_lossy()
        .to_string()
}
fn default_table() -> String {
    "photos".to_string()
}
fn default_vector_dim() -> usize {
    512
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            lance_path: default_lance_path(),
            supabase_url: None,
            supabase_key: None,
            table: default_table(),
            vector_dim: default_vector_dim(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// ONNX face detector (boxes + scores, NMS applied in-graph)
    #[serde(default = "default_detector_path")]
    pub detector_path: String,
    /// ONNX face recognizer (112x112 aligned crop -> embedding)
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: String,
    /// Square detector input size
    #[serde(default = "default_det_size")]
    pub det_size: u32,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    /// Number of session pairs in the analyzer pool (1-8)
    #[serde(default = "default_model_pool_size")]
    pub pool_size: usize,
}

fn default_detector_path() -> String {
    "models/det_10g.onnx".to_string()
}
fn default_recognizer_path() -> String {
    "models/w600k_r50.onnx".to_string()
}
fn default_det_size() -> u32 {
    640
}
fn default_score_threshold() -> f32 {
    0.5
}
fn default_intra_threads() -> usize {
    (num_cpus::get_physical() / 2).max(1)
}
fn default_model_pool_size() -> usize {
    2
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
            det_size: default_det_size(),
            score_threshold: default_score_threshold(),
            intra_threads: default_intra_threads(),
            pool_size: default_model_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_threshold() -> f32 {
    0.8
}
fn default_limit() -> usize {
    1000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            limit: default_limit(),
        }
    }
}

/// Default location: ~/.photofinder/config.toml
pub fn default_config_path() -> PathBuf {
    photofinder_home().join("config.toml")
}

pub fn photofinder_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".photofinder")
}

/// Load configuration. A missing or malformed file yields defaults.
/// Secrets are then taken from the environment when present.
pub fn load_config(config_path: &Path) -> PhotofinderConfig {
    let mut config = if !config_path.exists() {
        PhotofinderConfig::default()
    } else {
        match std::fs::read_to_string(config_path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse {}: {}", config_path.display(), e);
                PhotofinderConfig::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", config_path.display(), e);
                PhotofinderConfig::default()
            }
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn apply_env_overrides(config: &mut PhotofinderConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("SUPABASE_URL").filter(|v| !v.trim().is_empty()) {
        config.store.supabase_url = Some(url);
    }
    if let Some(key) = var("SUPABASE_KEY").filter(|v| !v.trim().is_empty()) {
        config.store.supabase_key = Some(key);
    }
}
