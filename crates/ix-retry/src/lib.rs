//! Indexing retry coordinator
//!
//! This crate keeps documents flowing into the index backend when it is slow or down:
//! - RetryQueue: bounded, per-destination FIFO buffers for undelivered documents
//! - IndexingRetryCoordinator: immediate delivery with fallback to queuing, bulk retries
//!   with exponential backoff, outage detection and recovery
//! - Drain loop: single background task that periodically re-sends queued documents

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod queue;

pub use config::RetryConfig;
pub use coordinator::IndexingRetryCoordinator;
pub use error::RetryError;
pub use queue::RetryQueue;

pub type Result<T> = std::result::Result<T, RetryError>;
