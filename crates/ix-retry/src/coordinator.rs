//! IndexingRetryCoordinator - delivery with fallback to bounded retry queues
//!
//! - Single documents: one attempt, queue on failure, never sleeps
//! - Bulk: up to N attempts with exponential backoff, then queue what failed
//! - Outage mode: entered when consecutive failures hit the threshold and a probe
//!   fails; foreground pushes then go straight to the queue until a probe succeeds
//!   and every queue is empty
//! - Drain loop: one background task re-sends queued documents on an interval

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ix_common::{Document, IndexClient, StatsCollector};

use crate::config::RetryConfig;
use crate::error::RetryError;
use crate::metrics as retry_metrics;
use crate::queue::RetryQueue;
use crate::Result;

/// Coordinates immediate delivery, retry queuing and outage handling.
///
/// Build one per process and share it behind an `Arc`. The drain loop is
/// spawned on the first push (or an explicit [`start`](Self::start)) and runs
/// until [`shutdown`](Self::shutdown).
pub struct IndexingRetryCoordinator {
    shared: Arc<CoordinatorState>,
    drain_started: AtomicBool,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    drain_spawns: std::sync::atomic::AtomicUsize,
}

/// State shared between foreground callers and the drain task
struct CoordinatorState {
    config: RetryConfig,
    client: Arc<dyn IndexClient>,
    stats: Arc<dyn StatsCollector>,
    queue: RetryQueue<Document>,
    consecutive_failures: AtomicU32,
    outage_mode: AtomicBool,
    last_outage_log: Mutex<Option<Instant>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// What part of a failed bulk batch goes back on the queue
enum Requeue {
    Whole,
    Positions(BTreeSet<usize>),
}

impl IndexingRetryCoordinator {
    pub fn new(
        config: RetryConfig,
        client: Arc<dyn IndexClient>,
        stats: Arc<dyn StatsCollector>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = CoordinatorState {
            queue: RetryQueue::new(config.max_queue_size_per_destination),
            config,
            client,
            stats,
            consecutive_failures: AtomicU32::new(0),
            outage_mode: AtomicBool::new(false),
            last_outage_log: Mutex::new(None),
            running: AtomicBool::new(true),
            shutdown_tx,
        };

        Ok(Self {
            shared: Arc::new(shared),
            drain_started: AtomicBool::new(false),
            drain_handle: Mutex::new(None),
            #[cfg(test)]
            drain_spawns: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Start the drain loop now instead of on the first push.
    pub fn start(&self) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(RetryError::ShutdownInProgress);
        }
        self.ensure_drain_started();
        Ok(())
    }

    /// Push one document.
    ///
    /// Returns true only if it was delivered right away. A queued document and a
    /// dropped one (queue full) both return false.
    pub async fn push_document(&self, destination: &str, document: Document) -> bool {
        self.ensure_drain_started();
        self.shared.push_document(destination, document).await
    }

    /// Push a batch, retrying with backoff. Returns how many documents were delivered.
    pub async fn push_bulk(&self, destination: &str, documents: Vec<Document>) -> usize {
        if documents.is_empty() {
            return 0;
        }
        self.ensure_drain_started();
        self.shared.push_bulk(destination, documents).await
    }

    /// Documents currently waiting for retry on `destination`
    pub fn queue_size(&self, destination: &str) -> usize {
        self.shared.queue.size(destination)
    }

    pub fn total_queued(&self) -> usize {
        self.shared.queue.total_size()
    }

    pub fn is_outage(&self) -> bool {
        self.shared.is_outage()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_drain_running(&self) -> bool {
        self.drain_handle
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the drain loop and abort any bulk backoff in progress.
    ///
    /// Documents still queued are discarded with the coordinator.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(queued = self.total_queued(), "Retry coordinator shutting down");
        let _ = self.shared.shutdown_tx.send(());

        let handle = self.drain_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Retry drain loop did not exit cleanly");
            }
        }
    }

    fn ensure_drain_started(&self) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        if self.drain_started.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(test)]
        self.drain_spawns.fetch_add(1, Ordering::SeqCst);

        let shutdown_rx = self.shared.shutdown_tx.subscribe();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            shared.run_drain_loop(shutdown_rx).await;
        });
        *self.drain_handle.lock() = Some(handle);

        info!(
            interval_normal = ?self.shared.config.drain_interval_normal,
            interval_outage = ?self.shared.config.drain_interval_outage,
            "Retry drain loop started"
        );
    }
}

impl CoordinatorState {
    fn is_outage(&self) -> bool {
        self.outage_mode.load(Ordering::SeqCst)
    }

    async fn push_document(&self, destination: &str, document: Document) -> bool {
        if !self.is_outage() {
            if self.client.push_one(destination, &document).await {
                self.on_delivery_success().await;
                retry_metrics::record_delivered(destination, 1);
                return true;
            }
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(destination = %destination, failures, "Document push failed, queuing for retry");
            self.maybe_enter_outage(failures).await;
        }

        if self.queue.offer(destination, document) {
            retry_metrics::record_queued(destination, 1);
            retry_metrics::set_queue_depth(destination, self.queue.size(destination));
        } else {
            warn!(destination = %destination, "Retry queue full, dropping document");
            self.report_dropped(destination, 1);
        }
        false
    }

    async fn push_bulk(&self, destination: &str, documents: Vec<Document>) -> usize {
        // Subscribe before reading `running` so a shutdown can't slip between the two
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_attempts = if self.is_outage() {
            1
        } else {
            self.config.bulk_retry_attempts
        };

        let mut success_count = 0;
        let mut requeue = Requeue::Whole;

        for attempt in 1..=max_attempts {
            let outcome = self.client.push_bulk(destination, &documents).await;

            if outcome.is_full_success(documents.len()) {
                self.on_delivery_success().await;
                retry_metrics::record_delivered(destination, documents.len());
                return documents.len();
            }

            if outcome.success_count > 0 {
                self.on_delivery_success().await;
                success_count = outcome.success_count;
                requeue = Requeue::Positions(
                    outcome
                        .failed_positions
                        .into_iter()
                        .filter(|&i| i < documents.len())
                        .collect(),
                );
                debug!(
                    destination = %destination,
                    succeeded = success_count,
                    total = documents.len(),
                    "Bulk push partially succeeded"
                );
                break;
            }

            if attempt == max_attempts {
                break;
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                destination = %destination,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Bulk push failed, backing off"
            );
            if !self.backoff(delay, &mut shutdown_rx).await {
                info!(destination = %destination, "Bulk retry interrupted by shutdown, queuing batch");
                break;
            }
        }

        retry_metrics::record_delivered(destination, success_count);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.maybe_enter_outage(failures).await;

        let to_queue: Vec<Document> = match requeue {
            Requeue::Whole => documents,
            Requeue::Positions(positions) => documents
                .into_iter()
                .enumerate()
                .filter(|(i, _)| positions.contains(i))
                .map(|(_, doc)| doc)
                .collect(),
        };
        self.enqueue_failed(destination, to_queue);

        success_count
    }

    /// Sleep for `delay`; false if shutdown was signalled first.
    async fn backoff(&self, delay: Duration, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_rx.recv() => false,
        }
    }

    fn enqueue_failed(&self, destination: &str, documents: Vec<Document>) {
        if documents.is_empty() {
            return;
        }
        let count = documents.len();

        if count > self.queue.capacity() {
            warn!(
                destination = %destination,
                count,
                capacity = self.queue.capacity(),
                "Bulk failure batch too large to queue, dropping"
            );
            self.report_dropped(destination, count);
            return;
        }

        let added = self.queue.offer_all(destination, documents);
        retry_metrics::record_queued(destination, added);
        retry_metrics::set_queue_depth(destination, self.queue.size(destination));
        if added < count {
            warn!(
                destination = %destination,
                dropped = count - added,
                "Retry queue full, dropping documents"
            );
            self.report_dropped(destination, count - added);
        }
    }

    /// Put undelivered drain documents back at the tail of their queue
    fn requeue(&self, destination: &str, documents: Vec<Document>) {
        let count = documents.len();
        let added = self.queue.offer_all(destination, documents);
        retry_metrics::set_queue_depth(destination, self.queue.size(destination));
        if added < count {
            warn!(
                destination = %destination,
                dropped = count - added,
                "Retry queue refilled while draining, dropping documents"
            );
            self.report_dropped(destination, count - added);
        }
    }

    fn report_dropped(&self, destination: &str, count: usize) {
        self.stats.record_failure(destination, count);
        retry_metrics::record_dropped(destination, count);
    }

    async fn on_delivery_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.is_outage() {
            self.check_recovery().await;
        }
    }

    /// Probe for an outage when the failure count lands exactly on the threshold.
    async fn maybe_enter_outage(&self, consecutive_failures: u32) {
        if consecutive_failures != self.config.consecutive_failures_before_check {
            return;
        }

        let status = self.client.test_connection().await;
        if status.success {
            debug!(
                consecutive_failures,
                "Backend reachable despite consecutive failures, resetting count"
            );
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return;
        }

        if !self.outage_mode.swap(true, Ordering::SeqCst) {
            retry_metrics::set_outage_mode(true);
        }
        if self.try_claim_outage_log() {
            error!(
                reason = %status.message,
                queue_sizes = %self.describe_queue_sizes(),
                "Index backend unreachable, queuing documents"
            );
        }
    }

    /// Leave outage mode once the backend answers and nothing is left queued.
    async fn check_recovery(&self) {
        let status = self.client.test_connection().await;
        if status.success && self.queue.all_empty() {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            if self.outage_mode.swap(false, Ordering::SeqCst) {
                retry_metrics::set_outage_mode(false);
                info!("Index backend reachable again, retry queue drained");
            }
        } else {
            debug!(
                probe_ok = status.success,
                queued = self.queue.total_size(),
                "Staying in outage mode"
            );
        }
    }

    /// True at most once per throttle window
    fn try_claim_outage_log(&self) -> bool {
        let mut last = self.last_outage_log.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.config.outage_log_throttle => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn describe_queue_sizes(&self) -> String {
        self.stats
            .index_keys()
            .iter()
            .filter_map(|key| {
                let size = self.queue.size(key);
                (size > 0).then(|| format!("{}={}", key, size))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn run_drain_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Retry drain loop running");
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let interval = self.config.drain_interval(self.is_outage());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.recv() => {
                    break;
                }
            }

            self.drain_cycle().await;
        }
        info!(queued = self.queue.total_size(), "Retry drain loop stopped");
    }

    /// One pass over every known destination.
    async fn drain_cycle(&self) {
        let queued = self.queue.total_size();
        if self.is_outage() && queued > 0 && self.try_claim_outage_log() {
            warn!(queued, "Index backend still unreachable, will retry");
        }

        let mut recovery_checked = false;
        for destination in self.stats.index_keys() {
            let mut batch = self
                .queue
                .poll_batch(&destination, self.config.drain_batch_size);
            if batch.is_empty() {
                continue;
            }

            let outcome = self.client.push_bulk(&destination, &batch).await;
            let sent = outcome.success_count.min(batch.len());

            if sent == batch.len() {
                self.stats.record_success(&destination, sent);
                retry_metrics::record_delivered(&destination, sent);
                debug!(destination = %destination, sent, "Drained queued documents");
                if self.is_outage() && self.queue.all_empty() {
                    self.check_recovery().await;
                    recovery_checked = true;
                }
            } else if sent > 0 {
                self.stats.record_success(&destination, sent);
                retry_metrics::record_delivered(&destination, sent);
                let remainder = batch.split_off(sent);
                debug!(
                    destination = %destination,
                    sent,
                    requeued = remainder.len(),
                    "Drain batch partially delivered"
                );
                self.requeue(&destination, remainder);
            } else {
                debug!(destination = %destination, count = batch.len(), "Drain batch failed, requeuing");
                self.requeue(&destination, batch);
            }

            retry_metrics::set_queue_depth(&destination, self.queue.size(&destination));
        }

        if !recovery_checked && self.is_outage() && self.queue.all_empty() {
            self.check_recovery().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ix_common::{BulkOutcome, ConnectionStatus};
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;

    struct MockClient {
        push_one_ok: AtomicBool,
        bulk_ok: AtomicBool,
        probe_ok: AtomicBool,
        scripted_bulk: Mutex<VecDeque<BulkOutcome>>,
        push_one_calls: AtomicUsize,
        bulk_calls: AtomicUsize,
        probe_calls: AtomicUsize,
    }

    impl MockClient {
        fn new(push_one_ok: bool, bulk_ok: bool, probe_ok: bool) -> Self {
            Self {
                push_one_ok: AtomicBool::new(push_one_ok),
                bulk_ok: AtomicBool::new(bulk_ok),
                probe_ok: AtomicBool::new(probe_ok),
                scripted_bulk: Mutex::new(VecDeque::new()),
                push_one_calls: AtomicUsize::new(0),
                bulk_calls: AtomicUsize::new(0),
                probe_calls: AtomicUsize::new(0),
            }
        }

        fn script_bulk(&self, outcome: BulkOutcome) {
            self.scripted_bulk.lock().push_back(outcome);
        }
    }

    #[async_trait]
    impl IndexClient for MockClient {
        async fn push_one(&self, _destination: &str, _document: &Document) -> bool {
            self.push_one_calls.fetch_add(1, Ordering::SeqCst);
            self.push_one_ok.load(Ordering::SeqCst)
        }

        async fn push_bulk(&self, _destination: &str, documents: &[Document]) -> BulkOutcome {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(outcome) = self.scripted_bulk.lock().pop_front() {
                return outcome;
            }
            if self.bulk_ok.load(Ordering::SeqCst) {
                BulkOutcome::all_succeeded(documents.len())
            } else {
                BulkOutcome::failed()
            }
        }

        async fn test_connection(&self) -> ConnectionStatus {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok.load(Ordering::SeqCst) {
                ConnectionStatus::reachable("opensearch", "2.11.0")
            } else {
                ConnectionStatus::unreachable("connection refused")
            }
        }
    }

    struct MockStats {
        keys: Vec<String>,
        successes: Mutex<Vec<(String, usize)>>,
        failures: Mutex<HashMap<String, usize>>,
    }

    impl MockStats {
        fn new(keys: &[&str]) -> Self {
            Self {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                successes: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
            }
        }

        fn failures_for(&self, key: &str) -> usize {
            self.failures.lock().get(key).copied().unwrap_or(0)
        }
    }

    impl StatsCollector for MockStats {
        fn record_success(&self, destination: &str, count: usize) {
            self.successes.lock().push((destination.to_string(), count));
        }

        fn record_failure(&self, destination: &str, count: usize) {
            *self.failures.lock().entry(destination.to_string()).or_insert(0) += count;
        }

        fn index_keys(&self) -> Vec<String> {
            self.keys.clone()
        }
    }

    fn doc(seq: usize) -> Document {
        let mut document = Document::new();
        document.insert("seq".to_string(), json!(seq));
        document
    }

    fn docs(range: std::ops::Range<usize>) -> Vec<Document> {
        range.map(doc).collect()
    }

    fn seq_of(document: &Document) -> u64 {
        document["seq"].as_u64().unwrap()
    }

    /// Keeps the background drain loop asleep unless a test opts in
    fn quiet_config() -> RetryConfig {
        RetryConfig {
            drain_interval_normal: Duration::from_secs(3600),
            drain_interval_outage: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn coordinator_with(
        config: RetryConfig,
        client: Arc<MockClient>,
        stats: Arc<MockStats>,
    ) -> IndexingRetryCoordinator {
        IndexingRetryCoordinator::new(config, client, stats).unwrap()
    }

    async fn enter_outage(coordinator: &IndexingRetryCoordinator, destination: &str) {
        for i in 0..3 {
            assert!(!coordinator.push_document(destination, doc(i)).await);
        }
        assert!(coordinator.is_outage());
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let client = Arc::new(MockClient::new(true, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        assert!(coordinator.push_document("traffic", doc(1)).await);
        assert_eq!(coordinator.queue_size("traffic"), 0);
        assert_eq!(coordinator.consecutive_failures(), 0);
        assert_eq!(client.push_one_calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_drain_running());
    }

    #[tokio::test]
    async fn test_three_failures_with_failed_probe_enter_outage() {
        let client = Arc::new(MockClient::new(false, false, false));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        enter_outage(&coordinator, "traffic").await;
        assert_eq!(client.probe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.push_one_calls.load(Ordering::SeqCst), 3);

        // Fourth push goes straight to the queue
        assert!(!coordinator.push_document("traffic", doc(3)).await);
        assert_eq!(client.push_one_calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.queue_size("traffic"), 4);
    }

    #[tokio::test]
    async fn test_successful_probe_at_threshold_resets_failures() {
        let client = Arc::new(MockClient::new(false, false, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        for i in 0..3 {
            coordinator.push_document("traffic", doc(i)).await;
        }
        assert!(!coordinator.is_outage());
        assert_eq!(coordinator.consecutive_failures(), 0);

        for i in 3..5 {
            coordinator.push_document("traffic", doc(i)).await;
        }
        assert_eq!(coordinator.consecutive_failures(), 2);
        assert_eq!(client.probe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.queue_size("traffic"), 5);
    }

    #[tokio::test]
    async fn test_outage_probe_only_at_exact_threshold() {
        let client = Arc::new(MockClient::new(false, false, false));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        enter_outage(&coordinator, "traffic").await;

        // In outage a bulk push gets one attempt; the counter moves past the
        // threshold without another probe
        assert_eq!(coordinator.push_bulk("traffic", docs(10..12)).await, 0);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.consecutive_failures(), 4);
        assert_eq!(client.probe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.queue_size("traffic"), 5);
    }

    #[tokio::test]
    async fn test_recovery_requires_empty_queues() {
        let client = Arc::new(MockClient::new(false, false, false));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats.clone());

        enter_outage(&coordinator, "traffic").await;
        assert_eq!(coordinator.queue_size("traffic"), 3);

        // Backend comes back, but the backlog is still there
        client.probe_ok.store(true, Ordering::SeqCst);
        client.bulk_ok.store(true, Ordering::SeqCst);
        assert_eq!(coordinator.push_bulk("traffic", docs(10..12)).await, 2);
        assert!(coordinator.is_outage());

        coordinator.shared.drain_cycle().await;
        assert!(!coordinator.is_outage());
        assert_eq!(coordinator.consecutive_failures(), 0);
        assert_eq!(coordinator.queue_size("traffic"), 0);
        assert_eq!(*stats.successes.lock(), vec![("traffic".to_string(), 3)]);
    }

    #[tokio::test]
    async fn test_drain_cycle_checks_recovery_with_empty_queues() {
        let client = Arc::new(MockClient::new(false, false, false));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        enter_outage(&coordinator, "traffic").await;
        coordinator.shared.queue.poll_batch("traffic", 100);

        // Probe still failing: stay in outage
        coordinator.shared.drain_cycle().await;
        assert!(coordinator.is_outage());

        client.probe_ok.store(true, Ordering::SeqCst);
        coordinator.shared.drain_cycle().await;
        assert!(!coordinator.is_outage());
    }

    #[tokio::test]
    async fn test_bulk_partial_failure_queues_only_failed_positions() {
        let client = Arc::new(MockClient::new(true, false, true));
        client.script_bulk(BulkOutcome::new(3, vec![2, 4]));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        let delivered = coordinator.push_bulk("traffic", docs(0..5)).await;
        assert_eq!(delivered, 3);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 1);

        let queued = coordinator.shared.queue.poll_batch("traffic", 10);
        assert_eq!(queued.iter().map(seq_of).collect::<Vec<_>>(), vec![2, 4]);
        // A partial success still counts as one failed invocation
        assert_eq!(coordinator.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_bulk_ignores_out_of_range_failed_positions() {
        let client = Arc::new(MockClient::new(true, false, true));
        client.script_bulk(BulkOutcome::new(1, vec![1, 7]));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client, stats);

        assert_eq!(coordinator.push_bulk("traffic", docs(0..2)).await, 1);
        assert_eq!(coordinator.queue_size("traffic"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_total_failure_backs_off_then_queues() {
        let client = Arc::new(MockClient::new(true, false, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        let started = Instant::now();
        let delivered = coordinator.push_bulk("traffic", docs(0..2)).await;

        assert_eq!(delivered, 0);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 3);
        // 1s + 2s between the three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(coordinator.queue_size("traffic"), 2);
        assert_eq!(coordinator.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_recovers_on_second_attempt() {
        let client = Arc::new(MockClient::new(true, true, true));
        client.script_bulk(BulkOutcome::failed());
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        assert_eq!(coordinator.push_bulk("traffic", docs(0..4)).await, 4);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.queue_size("traffic"), 0);
        assert_eq!(coordinator.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_failure_batch_is_dropped_whole() {
        let client = Arc::new(MockClient::new(true, false, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let config = RetryConfig {
            max_queue_size_per_destination: 2,
            ..quiet_config()
        };
        let coordinator = coordinator_with(config, client, stats.clone());

        assert_eq!(coordinator.push_bulk("traffic", docs(0..3)).await, 0);
        assert_eq!(coordinator.queue_size("traffic"), 0);
        assert_eq!(stats.failures_for("traffic"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_failure_fills_remaining_capacity() {
        let client = Arc::new(MockClient::new(true, false, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let config = RetryConfig {
            max_queue_size_per_destination: 3,
            ..quiet_config()
        };
        let coordinator = coordinator_with(config, client, stats.clone());
        coordinator.shared.queue.offer_all("traffic", docs(0..2));

        assert_eq!(coordinator.push_bulk("traffic", docs(10..12)).await, 0);
        assert_eq!(coordinator.queue_size("traffic"), 3);
        assert_eq!(stats.failures_for("traffic"), 1);

        let queued = coordinator.shared.queue.poll_batch("traffic", 10);
        assert_eq!(queued.iter().map(seq_of).collect::<Vec<_>>(), vec![0, 1, 10]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_single_document() {
        let client = Arc::new(MockClient::new(false, false, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let config = RetryConfig {
            max_queue_size_per_destination: 1,
            ..quiet_config()
        };
        let coordinator = coordinator_with(config, client, stats.clone());

        assert!(!coordinator.push_document("traffic", doc(0)).await);
        assert!(!coordinator.push_document("traffic", doc(1)).await);
        assert_eq!(coordinator.queue_size("traffic"), 1);
        assert_eq!(stats.failures_for("traffic"), 1);
    }

    #[tokio::test]
    async fn test_empty_bulk_is_noop() {
        let client = Arc::new(MockClient::new(true, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);

        assert_eq!(coordinator.push_bulk("traffic", Vec::new()).await, 0);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_drain_running());
    }

    #[tokio::test]
    async fn test_drain_cycle_delivers_one_batch_per_destination() {
        let client = Arc::new(MockClient::new(true, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats.clone());
        coordinator.shared.queue.offer_all("traffic", docs(0..150));

        coordinator.shared.drain_cycle().await;

        assert_eq!(*stats.successes.lock(), vec![("traffic".to_string(), 100)]);
        assert_eq!(coordinator.queue_size("traffic"), 50);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_cycle_partial_requeues_tail() {
        let client = Arc::new(MockClient::new(true, true, true));
        client.script_bulk(BulkOutcome::new(60, Vec::new()));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client, stats.clone());
        coordinator.shared.queue.offer_all("traffic", docs(0..150));

        coordinator.shared.drain_cycle().await;

        assert_eq!(*stats.successes.lock(), vec![("traffic".to_string(), 60)]);
        assert_eq!(coordinator.queue_size("traffic"), 90);

        let remaining: Vec<u64> = coordinator
            .shared
            .queue
            .poll_batch("traffic", 200)
            .iter()
            .map(seq_of)
            .collect();
        let expected: Vec<u64> = (100..150).chain(60..100).collect();
        assert_eq!(remaining, expected);
    }

    #[tokio::test]
    async fn test_drain_cycle_total_failure_requeues_batch() {
        let client = Arc::new(MockClient::new(true, false, true));
        let stats = Arc::new(MockStats::new(&["traffic", "findings"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats.clone());
        coordinator.shared.queue.offer_all("traffic", docs(0..10));
        coordinator.shared.queue.offer_all("findings", docs(0..5));

        coordinator.shared.drain_cycle().await;

        assert!(stats.successes.lock().is_empty());
        assert_eq!(coordinator.queue_size("traffic"), 10);
        assert_eq!(coordinator.queue_size("findings"), 5);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 2);
        // Drain failures never touch the foreground failure counter
        assert_eq!(coordinator.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_loop_retries_queued_documents() {
        let client = Arc::new(MockClient::new(false, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(RetryConfig::default(), client, stats.clone());

        assert!(!coordinator.push_document("traffic", doc(1)).await);
        assert_eq!(coordinator.queue_size("traffic"), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(coordinator.queue_size("traffic"), 0);
        assert_eq!(*stats.successes.lock(), vec![("traffic".to_string(), 1)]);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff_and_queues_batch() {
        let client = Arc::new(MockClient::new(true, false, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = Arc::new(coordinator_with(quiet_config(), client.clone(), stats));

        let pushing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.push_bulk("traffic", docs(0..3)).await })
        };

        // First attempt has failed; the push is now in its 1s backoff
        tokio::time::sleep(Duration::from_millis(500)).await;
        coordinator.shutdown().await;

        assert_eq!(pushing.await.unwrap(), 0);
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.queue_size("traffic"), 3);
        assert!(!coordinator.is_drain_running());
        assert!(matches!(coordinator.start(), Err(RetryError::ShutdownInProgress)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pushes_start_one_drain_loop() {
        let client = Arc::new(MockClient::new(true, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = Arc::new(coordinator_with(quiet_config(), client.clone(), stats));

        let pushes = (0..32).map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.push_document("traffic", doc(i)).await })
        });
        let results = futures::future::join_all(pushes).await;

        assert!(results.into_iter().all(|r| r.unwrap()));
        assert!(coordinator.drain_started.load(Ordering::SeqCst));
        assert_eq!(coordinator.drain_spawns.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_drain_running());
        assert_eq!(client.push_one_calls.load(Ordering::SeqCst), 32);
        coordinator.shutdown().await;
        assert!(!coordinator.is_drain_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_log_is_throttled() {
        let client = Arc::new(MockClient::new(true, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let coordinator = coordinator_with(quiet_config(), client, stats);

        assert!(coordinator.shared.try_claim_outage_log());
        assert!(!coordinator.shared.try_claim_outage_log());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(coordinator.shared.try_claim_outage_log());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_loop_waits_outage_interval() {
        let client = Arc::new(MockClient::new(false, false, false));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let config = RetryConfig {
            outage_log_throttle: Duration::from_secs(45),
            ..Default::default()
        };
        let coordinator = coordinator_with(config, client.clone(), stats);
        let started = Instant::now();

        coordinator.shared.outage_mode.store(true, Ordering::SeqCst);
        coordinator.shared.queue.offer_all("traffic", docs(0..2));
        coordinator.start().unwrap();

        // Past the normal 5s interval, still nothing drained
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 0);
        assert!(coordinator.shared.last_outage_log.lock().is_none());

        // First cycle at 30s logs and requeues the failed batch
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.queue_size("traffic"), 2);
        let first_log = coordinator.shared.last_outage_log.lock().unwrap();
        assert!(first_log >= started + Duration::from_secs(30));
        assert!(first_log < started + Duration::from_secs(31));

        // Second cycle at 60s falls inside the 45s window and stays quiet
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*coordinator.shared.last_outage_log.lock(), Some(first_log));

        // Third cycle at 90s is past the window and logs again
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 3);
        let second_log = coordinator.shared.last_outage_log.lock().unwrap();
        assert!(second_log >= started + Duration::from_secs(90));
        assert!(coordinator.is_outage());

        coordinator.shutdown().await;
    }

    #[test]
    fn test_queue_depth_gauge_tracks_offers() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let client = Arc::new(MockClient::new(false, false, false));
        let stats = Arc::new(MockStats::new(&["traffic", "findings"]));
        let coordinator = coordinator_with(quiet_config(), client.clone(), stats);
        coordinator.shared.outage_mode.store(true, Ordering::SeqCst);

        metrics::with_local_recorder(&recorder, || {
            // Outage mode queues without touching the client
            let queued = futures::executor::block_on(
                coordinator.shared.push_document("findings", doc(1)),
            );
            assert!(!queued);
            coordinator.shared.enqueue_failed("traffic", docs(0..3));
            coordinator.shared.requeue("traffic", docs(3..5));
        });

        assert_eq!(client.push_one_calls.load(Ordering::SeqCst), 0);
        let rendered = handle.render();
        assert!(rendered.contains(r#"ix_retry_queue_depth{destination="findings"} 1"#));
        assert!(rendered.contains(r#"ix_retry_queue_depth{destination="traffic"} 5"#));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let client = Arc::new(MockClient::new(true, true, true));
        let stats = Arc::new(MockStats::new(&["traffic"]));
        let config = RetryConfig {
            drain_batch_size: 0,
            ..Default::default()
        };
        let result = IndexingRetryCoordinator::new(config, client, stats);
        assert!(matches!(result, Err(RetryError::InvalidConfig(_))));
    }
}
