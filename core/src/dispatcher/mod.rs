//! Ingress-to-sink pipeline: a bounded queue, a worker pool
//! that assembles batches and calls into the configured sinks, and a
//! low-priority retry queue fed by retryable failures.
//!
//! Worker tasks live in a `Mutex<Vec<JoinHandle<()>>>`, a `CancellationToken`
//! is threaded through every `select!`, and shutdown joins them with a
//! timeout. The retry token bucket's rate/burst/attempt fields follow the
//! same naming as the rest of this crate's retry configs.

pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedup::DeduplicationCache;
use crate::dlq::Dlq;
use crate::position::PositionStore;
use crate::sinks::{SendOutcome, Sink, SinkSet};
use crate::types::{Batch, DlqEntry, FailureReasonTag, LogEntry, SourceCursor, SourceId};

pub use retry::TokenBucket;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub ingress_capacity: usize,
    pub retry_capacity: usize,
    pub worker_count: usize,
    pub batch_max_entries: usize,
    pub batch_max_bytes: usize,
    pub batch_timeout: Duration,
    pub max_attempts: u32,
    pub high_water_ratio: f64,
    pub retry_budget_per_second: f64,
    pub retry_budget_burst: f64,
    pub drop_policy: DropPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 50_000,
            retry_capacity: 5_000,
            worker_count: 6,
            batch_max_entries: 500,
            batch_max_bytes: 1_000_000,
            batch_timeout: Duration::from_millis(500),
            max_attempts: 10,
            high_water_ratio: 0.9,
            retry_budget_per_second: 50.0,
            retry_budget_burst: 200.0,
            drop_policy: DropPolicy::default(),
        }
    }
}

struct RetryItem {
    entry: LogEntry,
    not_before: tokio::time::Instant,
}

/// What happens to a retry-queue arrival when the queue is already full.
/// `DropOldest` is the default: an entry that already survived one failed
/// delivery has more invested in it, so the queue evicts the stalest
/// waiting item to make room for the new one instead.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DropPolicy {
    #[default]
    DropOldest,
    DropNewest,
    DropRandom,
}

/// Owns the ingress queue, the retry queue, and the worker pool that drains
/// both into a [`SinkSet`]. `submit` is the single entry point every
/// monitor and DLQ-reprocess path calls into.
pub struct Dispatcher {
    config: DispatcherConfig,
    ingress_tx: mpsc::Sender<LogEntry>,
    ingress_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    /// Populated by `start` once the receiver has been handed to the worker
    /// pool, so `shutdown` can drain whatever is left in the queue after
    /// workers stop pulling from it (spec §4.9 step 2).
    ingress_rx_handle: Mutex<Option<Arc<Mutex<mpsc::Receiver<LogEntry>>>>>,
    retry_tx: mpsc::Sender<RetryItem>,
    retry_rx: Mutex<Option<mpsc::Receiver<RetryItem>>>,
    /// Populated by `start` once the receiver has been handed to the worker
    /// pool, so `requeue_for_retry` can still evict the oldest waiting item
    /// under `DropPolicy::DropOldest` without owning the receiver itself,
    /// and so `shutdown` can drain it to the DLQ.
    retry_rx_handle: Mutex<Option<Arc<Mutex<mpsc::Receiver<RetryItem>>>>>,
    dedup: Arc<DeduplicationCache>,
    sinks: Arc<SinkSet>,
    position_store: Arc<PositionStore>,
    dlq: Arc<Dlq>,
    retry_budget: TokenBucket,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pub backpressure_active: AtomicBool,
    pub entries_submitted: AtomicU64,
    pub entries_dropped: AtomicU64,
    pub entries_delivered: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        dedup: Arc<DeduplicationCache>,
        sinks: Arc<SinkSet>,
        position_store: Arc<PositionStore>,
        dlq: Arc<Dlq>,
    ) -> Arc<Self> {
        let (ingress_tx, ingress_rx) = mpsc::channel(config.ingress_capacity);
        let (retry_tx, retry_rx) = mpsc::channel(config.retry_capacity);
        let retry_budget = TokenBucket::new(config.retry_budget_per_second, config.retry_budget_burst);

        Arc::new(Self {
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            ingress_rx_handle: Mutex::new(None),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            retry_rx_handle: Mutex::new(None),
            dedup,
            sinks,
            position_store,
            dlq,
            retry_budget,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            backpressure_active: AtomicBool::new(false),
            entries_submitted: AtomicU64::new(0),
            entries_dropped: AtomicU64::new(0),
            entries_delivered: AtomicU64::new(0),
            config,
        })
    }

    /// Called by monitors with freshly-read entries, and by DLQ reprocessing
    /// with recovered ones. Applies dedup, then enqueues onto ingress.
    /// Returns `false` if the entry was dropped (duplicate or queue full
    /// under backpressure).
    pub async fn submit(&self, entry: LogEntry) -> bool {
        if !self.dedup.observe_if_new(entry.fingerprint).await {
            return false;
        }
        self.submit_bypassing_dedup(entry).await
    }

    /// Entry point for DLQ reprocessing, which must not be filtered by the
    /// dedup cache (a dead-lettered entry is not, by construction, a
    /// duplicate of anything currently in flight).
    pub async fn submit_bypassing_dedup(&self, entry: LogEntry) -> bool {
        self.entries_submitted.fetch_add(1, Ordering::Relaxed);
        self.update_backpressure_gauge();

        match self.ingress_tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("ingress queue full, dropping entry");
                self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn update_backpressure_gauge(&self) {
        let capacity = self.config.ingress_capacity as f64;
        let used = capacity - self.ingress_tx.capacity() as f64;
        let active = used / capacity >= self.config.high_water_ratio;
        self.backpressure_active.store(active, Ordering::Relaxed);
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressure_active.load(Ordering::Relaxed)
    }

    /// Number of worker tasks currently running.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Spawns `worker_count` workers, each preferring the ingress queue but
    /// periodically servicing the retry queue so retries aren't starved.
    pub async fn start(self: &Arc<Self>) {
        let ingress_rx = self.ingress_rx.lock().await.take().expect("start called twice");
        let retry_rx = self.retry_rx.lock().await.take().expect("start called twice");
        let ingress_rx = Arc::new(Mutex::new(ingress_rx));
        let retry_rx = Arc::new(Mutex::new(retry_rx));
        *self.ingress_rx_handle.lock().await = Some(Arc::clone(&ingress_rx));
        *self.retry_rx_handle.lock().await = Some(Arc::clone(&retry_rx));

        let mut workers = self.workers.lock().await;
        for id in 0..self.config.worker_count {
            let dispatcher = Arc::clone(self);
            let ingress_rx = Arc::clone(&ingress_rx);
            let retry_rx = Arc::clone(&retry_rx);
            workers.push(tokio::spawn(async move {
                dispatcher.worker_loop(id, ingress_rx, retry_rx).await;
            }));
        }
        info!(workers = self.config.worker_count, "dispatcher started");
    }

    async fn worker_loop(
        self: Arc<Self>,
        id: usize,
        ingress_rx: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
        retry_rx: Arc<Mutex<mpsc::Receiver<RetryItem>>>,
    ) {
        let mut tick = 0u64;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // service the retry queue every 4th iteration so it never starves
            // ingress, but also never goes completely unserved.
            tick += 1;
            let batch = if tick % 4 == 0 {
                self.assemble_batch(&retry_rx, true).await
            } else {
                self.assemble_batch_from_ingress(&ingress_rx).await
            };

            let Some(batch) = batch else {
                if self.shutdown.is_cancelled() {
                    break;
                }
                continue;
            };
            if batch.is_empty() {
                continue;
            }

            debug!(worker = id, entries = batch.len(), "dispatching batch");
            self.dispatch_to_sinks(batch).await;
        }
    }

    async fn assemble_batch_from_ingress(
        &self,
        ingress_rx: &Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    ) -> Option<Batch> {
        let mut rx = ingress_rx.lock().await;
        let mut batch = Batch::new();
        let deadline = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(deadline);

        loop {
            if batch.len() >= self.config.batch_max_entries || batch.byte_len >= self.config.batch_max_bytes {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled(), if batch.is_empty() => return None,
                maybe = rx.recv() => {
                    match maybe {
                        Some(entry) => batch.push(entry),
                        None => break,
                    }
                }
                _ = &mut deadline => break,
            }
        }
        Some(batch)
    }

    async fn assemble_batch(
        &self,
        retry_rx: &Arc<Mutex<mpsc::Receiver<RetryItem>>>,
        respect_schedule: bool,
    ) -> Option<Batch> {
        let mut rx = retry_rx.lock().await;
        let mut batch = Batch::new();
        while batch.len() < self.config.batch_max_entries {
            match rx.try_recv() {
                Ok(item) => {
                    if respect_schedule && item.not_before > tokio::time::Instant::now() {
                        // not due yet; re-send to the back and stop scanning
                        // rather than busy-loop past the whole queue.
                        let _ = self.retry_tx.try_send(item);
                        break;
                    }
                    batch.push(item.entry);
                }
                Err(_) => break,
            }
        }
        Some(batch)
    }

    async fn dispatch_to_sinks(&self, batch: Batch) {
        for sink in self.sinks.iter() {
            if !sink.is_healthy().await {
                self.requeue_for_retry(&batch, sink.name()).await;
                continue;
            }
            match sink.send(&batch).await {
                SendOutcome::Success => {
                    self.entries_delivered
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.advance_positions(&batch).await;
                }
                SendOutcome::Retryable => {
                    self.requeue_for_retry(&batch, sink.name()).await;
                }
                SendOutcome::Permanent => {
                    self.dead_letter(&batch, sink.name(), FailureReasonTag::Permanent)
                        .await;
                }
            }
        }
    }

    async fn requeue_for_retry(&self, batch: &Batch, sink_name: &str) {
        for entry in &batch.entries {
            let mut entry = entry.clone();
            entry.attempt_count += 1;
            if entry.attempt_count > self.config.max_attempts {
                self.dead_letter_entry(entry, sink_name, FailureReasonTag::ExhaustedRetries)
                    .await;
                continue;
            }
            if !self.retry_budget.try_consume(1.0) {
                self.dead_letter_entry(entry, sink_name, FailureReasonTag::Dropped)
                    .await;
                continue;
            }
            let delay = backoff_for_attempt(entry.attempt_count);
            let item = RetryItem {
                entry,
                not_before: tokio::time::Instant::now() + delay,
            };
            self.enqueue_retry_item(item).await;
        }
    }

    /// Sends `item` onto the retry queue, applying `config.drop_policy` if
    /// the queue is already full rather than blocking the worker.
    async fn enqueue_retry_item(&self, item: RetryItem) {
        let item = match self.retry_tx.try_send(item) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(item)) => item,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.config.drop_policy {
            DropPolicy::DropOldest => {
                if let Some(handle) = self.retry_rx_handle.lock().await.clone() {
                    handle.lock().await.try_recv().ok();
                }
                self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                if self.retry_tx.try_send(item).is_err() {
                    // a concurrent worker refilled the slot first; the new
                    // item still doesn't fit, count it dropped too.
                    self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            DropPolicy::DropNewest => {
                self.entries_dropped.fetch_add(1, Ordering::Relaxed);
            }
            DropPolicy::DropRandom => {
                use rand::Rng;
                if rand::rng().random_bool(0.5) {
                    if let Some(handle) = self.retry_rx_handle.lock().await.clone() {
                        handle.lock().await.try_recv().ok();
                    }
                    self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                    if self.retry_tx.try_send(item).is_err() {
                        self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    self.entries_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn dead_letter(&self, batch: &Batch, sink_name: &str, reason: FailureReasonTag) {
        for entry in &batch.entries {
            self.dead_letter_entry(entry.clone(), sink_name, reason).await;
        }
    }

    async fn dead_letter_entry(&self, entry: LogEntry, sink_name: &str, reason: FailureReasonTag) {
        let dlq_entry = DlqEntry {
            first_failed_at: chrono::Utc::now(),
            attempt_history: vec![format!("attempt {} via {}", entry.attempt_count, sink_name)],
            destination_sink: sink_name.to_string(),
            failure_reason_tag: reason,
            entry,
        };
        if let Err(e) = self.dlq.write(dlq_entry).await {
            warn!(error = %e, "failed to write dlq entry, entry is now unrecoverable");
        }
    }

    /// Advances the durable `PositionStore` record for each source touched
    /// by `batch`, up to the highest confirmed `SourceCursor` per source —
    /// this is the only place that record is allowed to move, and only
    /// after a sink has reported `Success` for the entries it covers (spec
    /// I1). Gated on a matching inode so a rotation between read and
    /// delivery can't let a stale cursor advance the new generation's
    /// offset.
    async fn advance_positions(&self, batch: &Batch) {
        let mut max_cursor: HashMap<SourceId, SourceCursor> = HashMap::new();
        for entry in &batch.entries {
            if let Some(cursor) = entry.cursor {
                max_cursor
                    .entry(entry.source_id.clone())
                    .and_modify(|existing| {
                        if cursor.end_offset > existing.end_offset {
                            *existing = cursor;
                        }
                    })
                    .or_insert(cursor);
            }
        }

        for (source_id, cursor) in max_cursor {
            if let Some(mut record) = self.position_store.get(&source_id.0).await {
                if record.inode == cursor.inode && cursor.end_offset > record.byte_offset {
                    record.byte_offset = cursor.end_offset;
                    record.size_at_read = record.size_at_read.max(cursor.end_offset);
                    record.last_read_wall_time = chrono::Utc::now();
                    self.position_store.set(record).await;
                }
            }
        }
    }

    /// Cancels worker loops, joins them within `deadline`, drains whatever
    /// is left in the ingress and retry queues straight to the DLQ (spec
    /// §4.9 step 2 — no in-memory-only terminal state, P7), then flushes
    /// every configured sink (step 3).
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        let handles = std::mem::take(&mut *workers);
        let join_all = futures_util::future::join_all(handles);
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("dispatcher shutdown deadline exceeded, some workers may still be running");
        }

        self.drain_remaining_to_dlq().await;
        self.sinks.close_all().await;
    }

    /// Workers have stopped pulling from both queues by the time this runs;
    /// whatever is still sitting in them never reached a sink and would
    /// otherwise vanish when the channels are dropped.
    async fn drain_remaining_to_dlq(&self) {
        let ingress_handle = self.ingress_rx_handle.lock().await.clone();
        if let Some(rx) = ingress_handle {
            let mut rx = rx.lock().await;
            let mut drained = 0u64;
            while let Ok(entry) = rx.try_recv() {
                drained += 1;
                self.dead_letter_entry(entry, "shutdown_drain", FailureReasonTag::ExhaustedRetries)
                    .await;
            }
            if drained > 0 {
                info!(count = drained, "drained unshipped ingress entries to dlq at shutdown");
            }
        }

        let retry_handle = self.retry_rx_handle.lock().await.clone();
        if let Some(rx) = retry_handle {
            let mut rx = rx.lock().await;
            let mut drained = 0u64;
            while let Ok(item) = rx.try_recv() {
                drained += 1;
                self.dead_letter_entry(item.entry, "shutdown_drain", FailureReasonTag::ExhaustedRetries)
                    .await;
            }
            if drained > 0 {
                info!(count = drained, "drained unshipped retry entries to dlq at shutdown");
            }
        }
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let base = Duration::from_millis(500);
    base.saturating_mul(1u32 << attempt.min(10))
        .min(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::SinkSet;
    use crate::types::SourceId;

    struct AlwaysSuccessSink;

    #[async_trait::async_trait]
    impl Sink for AlwaysSuccessSink {
        fn name(&self) -> &str {
            "test"
        }
        async fn send(&self, _batch: &Batch) -> SendOutcome {
            SendOutcome::Success
        }
    }

    fn test_dispatcher() -> Arc<Dispatcher> {
        let dir = tempfile::tempdir().unwrap();
        let position_store = PositionStore::new(crate::position::PositionStoreConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let dlq = Arc::new(Dlq::new(crate::dlq::DlqConfig {
            dir: dir.path().join("dlq"),
            ..Default::default()
        }));
        let dedup = Arc::new(DeduplicationCache::new(Default::default()));
        let sinks = Arc::new(SinkSet::new(vec![Arc::new(AlwaysSuccessSink)]));
        Dispatcher::new(DispatcherConfig::default(), dedup, sinks, position_store, dlq)
    }

    #[tokio::test]
    async fn submit_deduplicates() {
        let dispatcher = test_dispatcher();
        let entry = LogEntry::new(
            SourceId::for_file("/a"),
            "hello".into(),
            chrono::Utc::now(),
            Default::default(),
        );
        assert!(dispatcher.submit(entry.clone()).await);
        assert!(!dispatcher.submit(entry).await);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_stalest_waiting_retry_not_the_new_arrival() {
        let mut config = DispatcherConfig::default();
        config.retry_capacity = 2;
        config.drop_policy = DropPolicy::DropOldest;

        let dir = tempfile::tempdir().unwrap();
        let position_store = PositionStore::new(crate::position::PositionStoreConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let dlq = Arc::new(Dlq::new(crate::dlq::DlqConfig {
            dir: dir.path().join("dlq"),
            ..Default::default()
        }));
        let dedup = Arc::new(DeduplicationCache::new(Default::default()));
        let sinks = Arc::new(SinkSet::new(vec![Arc::new(AlwaysSuccessSink)]));
        let dispatcher = Dispatcher::new(config, dedup, sinks, position_store, dlq);
        // populate retry_rx_handle without spawning workers, so the retry
        // queue is only drained by this test's direct calls below.
        let retry_rx = dispatcher.retry_rx.lock().await.take().unwrap();
        *dispatcher.retry_rx_handle.lock().await = Some(Arc::new(Mutex::new(retry_rx)));

        for i in 0..3 {
            let item = RetryItem {
                entry: LogEntry::new(
                    SourceId::for_file("/a"),
                    format!("retry {i}"),
                    chrono::Utc::now(),
                    Default::default(),
                ),
                not_before: tokio::time::Instant::now() + Duration::from_secs(60),
            };
            dispatcher.enqueue_retry_item(item).await;
        }

        assert_eq!(dispatcher.entries_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn end_to_end_delivery_through_worker_pool() {
        let dispatcher = test_dispatcher();
        dispatcher.start().await;
        for i in 0..10 {
            let entry = LogEntry::new(
                SourceId::for_file("/a"),
                format!("line {i}"),
                chrono::Utc::now(),
                Default::default(),
            );
            dispatcher.submit(entry).await;
        }
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(dispatcher.entries_delivered.load(Ordering::Relaxed), 10);
        dispatcher.shutdown(Duration::from_secs(1)).await;
    }
}
