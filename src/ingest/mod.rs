pub mod aggregator;
pub mod fetcher;
pub mod persister;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod validator;

use thiserror::Error;

pub use aggregator::ResultAggregator;
pub use fetcher::{Fetcher, HttpTransport};
pub use persister::Persister;
pub use pipeline::{run_ingestion, RunOptions};
pub use scheduler::{ItemProcessor, PhotoProcessor};

/// Run-level failures. Per-item problems are outcomes, never errors.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Audit artifact error: {0}")]
    Audit(#[from] std::io::Error),
}
