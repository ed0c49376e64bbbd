//! photofinder: face ingestion from Drive share links and selfie lookup
//! against a vector store.

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod extract;
pub mod ingest;
pub mod listing;
pub mod metrics;
pub mod models;
pub mod query;
pub mod resource_limits;
pub mod server;
pub mod storage;
