//! OpenSearch / Elasticsearch delivery for the index exporter
//!
//! Thin reqwest wrapper that implements [`ix_common::IndexClient`]. It makes one
//! attempt per call and never queues; retrying is the coordinator's job.

pub mod client;
pub mod config;
pub mod error;
pub mod naming;

pub use client::OpenSearchClient;
pub use config::OpenSearchConfig;
pub use error::OpenSearchError;

pub type Result<T> = std::result::Result<T, OpenSearchError>;
