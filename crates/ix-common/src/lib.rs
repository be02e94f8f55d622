//! Shared types for the index exporter
//!
//! - Document: opaque JSON payload pushed to a destination
//! - IndexClient: the delivery capability the retry coordinator consumes
//! - StatsCollector: per-destination outcome accounting

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// Core Document Types
// ============================================================================

/// A document as handed to the exporter. Field names map to arbitrary JSON values;
/// nothing in the delivery path looks inside it.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Default destination keys, in the order the drain loop services them.
pub const DEFAULT_INDEX_KEYS: [&str; 5] = ["traffic", "tool", "settings", "sitemap", "findings"];

// ============================================================================
// Delivery Outcome Types
// ============================================================================

/// Result of one bulk delivery attempt.
///
/// `failed_positions` index into the batch that was sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub success_count: usize,
    pub failed_positions: Vec<usize>,
}

impl BulkOutcome {
    pub fn new(success_count: usize, failed_positions: Vec<usize>) -> Self {
        Self {
            success_count,
            failed_positions,
        }
    }

    /// Nothing was accepted and no per-item detail is available.
    pub fn failed() -> Self {
        Self::default()
    }

    /// Every document in a batch of `batch_len` was accepted.
    pub fn all_succeeded(batch_len: usize) -> Self {
        Self {
            success_count: batch_len,
            failed_positions: Vec::new(),
        }
    }

    pub fn is_full_success(&self, batch_len: usize) -> bool {
        self.success_count >= batch_len
    }
}

/// Result of a connectivity probe against the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub success: bool,
    pub distribution: String,
    pub version: String,
    pub message: String,
}

impl ConnectionStatus {
    pub fn reachable(distribution: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            success: true,
            distribution: distribution.into(),
            version: version.into(),
            message: "Connection successful".to_string(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            success: false,
            distribution: String::new(),
            version: String::new(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// One-shot delivery to the index backend. Implementations never retry or queue.
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Index a single document. `true` only when the backend acknowledged it.
    async fn push_one(&self, destination: &str, document: &Document) -> bool;

    /// Index a batch in one request, reporting which positions failed.
    async fn push_bulk(&self, destination: &str, documents: &[Document]) -> BulkOutcome;

    /// Lightweight liveness probe.
    async fn test_connection(&self) -> ConnectionStatus;
}

/// Per-destination outcome accounting.
pub trait StatsCollector: Send + Sync {
    fn record_success(&self, destination: &str, count: usize);

    fn record_failure(&self, destination: &str, count: usize);

    /// Destinations the drain loop should service.
    fn index_keys(&self) -> Vec<String>;
}
