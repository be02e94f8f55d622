//! NDJSON input to the retry coordinator
//!
//! Each input line is `{"destination": "...", "document": {...}}`. Documents are
//! buffered per destination and flushed when a buffer reaches the bulk size, on
//! every interval tick, and when input ends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ix_common::{Document, StatsCollector};
use ix_retry::IndexingRetryCoordinator;
use ix_stats::ExportStats;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct InboundRecord {
    pub destination: String,
    pub document: Document,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    pub lines_read: u64,
    pub malformed: u64,
    /// Well-formed records for a destination the drain loop does not service
    pub rejected: u64,
    /// Documents delivered on the first push; queued ones are not counted
    pub delivered: u64,
}

pub struct Forwarder {
    coordinator: Arc<IndexingRetryCoordinator>,
    stats: Arc<ExportStats>,
    bulk_size: usize,
    destinations: HashSet<String>,
    buffers: HashMap<String, Vec<Document>>,
    summary: ForwardSummary,
}

impl Forwarder {
    pub fn new(
        coordinator: Arc<IndexingRetryCoordinator>,
        stats: Arc<ExportStats>,
        bulk_size: usize,
    ) -> Self {
        let destinations = StatsCollector::index_keys(stats.as_ref()).into_iter().collect();
        Self {
            coordinator,
            stats,
            bulk_size: bulk_size.max(1),
            destinations,
            buffers: HashMap::new(),
            summary: ForwardSummary::default(),
        }
    }

    /// Read until EOF, a read error or shutdown, then flush what is buffered.
    pub async fn run<R>(
        mut self,
        reader: R,
        flush_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ForwardSummary
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => {
                        info!(lines = self.summary.lines_read, "Input closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read input, stopping");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush_all().await,
                _ = shutdown_rx.recv() => {
                    info!("Forwarder stopping");
                    break;
                }
            }
        }

        self.flush_all().await;
        self.summary
    }

    async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.summary.lines_read += 1;

        match serde_json::from_str::<InboundRecord>(line) {
            Ok(record) => self.accept(record).await,
            Err(e) => {
                self.summary.malformed += 1;
                warn!(error = %e, line = self.summary.lines_read, "Skipping malformed input line");
            }
        }
    }

    /// Buffer a record. Destinations outside the configured index keys are
    /// rejected, since nothing would ever drain them.
    pub async fn accept(&mut self, record: InboundRecord) {
        if !self.destinations.contains(&record.destination) {
            self.summary.rejected += 1;
            warn!(destination = %record.destination, "Rejecting record for unconfigured destination");
            return;
        }
        let buffer = self.buffers.entry(record.destination.clone()).or_default();
        buffer.push(record.document);
        if buffer.len() >= self.bulk_size {
            self.flush(&record.destination).await;
        }
    }

    pub async fn flush_all(&mut self) {
        let pending: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(destination, _)| destination.clone())
            .collect();
        for destination in pending {
            self.flush(&destination).await;
        }
    }

    async fn flush(&mut self, destination: &str) {
        let mut documents = match self.buffers.get_mut(destination) {
            Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
            _ => return,
        };
        let count = documents.len();
        let started = Instant::now();

        let delivered = if count == 1 {
            match documents.pop() {
                Some(document) => {
                    usize::from(self.coordinator.push_document(destination, document).await)
                }
                None => 0,
            }
        } else {
            self.coordinator.push_bulk(destination, documents).await
        };

        self.stats.record_success(destination, delivered as u64);
        self.stats.record_last_push(destination, started.elapsed());
        self.summary.delivered += delivered as u64;

        debug!(destination = %destination, count, delivered, "Flushed buffer");
    }

    pub fn buffered(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }
}
