//! Scheduled DLQ reprocessing: periodically feeds sealed dead
//! letter files back through the dispatcher's ingress, bypassing dedup.
//!
//! A background task draining one source (here, sealed DLQ files) and
//! republishing onto the same ingress point the original producers use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

use super::Dlq;

#[derive(Clone, Debug)]
pub struct ReprocessConfig {
    /// How often to scan for sealed files ready to reprocess.
    pub scan_interval: Duration,
    /// Upper bound on sealed files touched per scan, so a backlog of dead
    /// letters can't monopolize the dispatcher's ingress in one pass.
    pub max_files_per_cycle: usize,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            max_files_per_cycle: 4,
        }
    }
}

struct FileState {
    attempt: u32,
    not_before: tokio::time::Instant,
}

/// Drains sealed DLQ files back into the dispatcher on a schedule,
/// respecting each file's own backoff so a file that keeps failing doesn't
/// get scanned every cycle.
pub struct DlqReprocessor {
    config: ReprocessConfig,
    dlq: Arc<Dlq>,
    dispatcher: Arc<Dispatcher>,
    file_state: Mutex<HashMap<PathBuf, FileState>>,
}

impl DlqReprocessor {
    pub fn new(config: ReprocessConfig, dlq: Arc<Dlq>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dlq,
            dispatcher,
            file_state: Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => this.run_once().await,
                }
            }
        })
    }

    /// One scan pass: public so tests (and a future admin-triggered
    /// "reprocess now" surface) can drive it without waiting on the ticker.
    pub async fn run_once(&self) {
        let files = match self.dlq.sealed_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "failed to list sealed dlq files");
                return;
            }
        };

        let mut touched = 0usize;
        for path in files {
            if touched >= self.config.max_files_per_cycle {
                break;
            }
            if !self.is_due(&path).await {
                continue;
            }
            touched += 1;
            self.reprocess_file(&path).await;
        }
    }

    async fn is_due(&self, path: &PathBuf) -> bool {
        match self.file_state.lock().await.get(path) {
            Some(state) => state.not_before <= tokio::time::Instant::now(),
            None => true,
        }
    }

    async fn reprocess_file(&self, path: &PathBuf) {
        let entries = match self.dlq.read_file(path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read dlq file for reprocessing");
                return;
            }
        };

        if entries
            .iter()
            .any(|e| !Dlq::is_reprocess_eligible(e.failure_reason_tag))
        {
            // A permanently-rejected entry shares this file with retryable
            // ones (both land in the same active file when they fail around
            // the same time). Leave the whole file alone rather than risk
            // dropping the permanent entries on a partial rewrite; an
            // operator inspects and clears these by hand.
            warn!(path = %path.display(), "dlq file contains a permanent entry, skipping reprocess");
            return;
        }

        let total = entries.len();
        let mut unresolved = Vec::new();
        for dlq_entry in entries {
            if !self
                .dispatcher
                .submit_bypassing_dedup(dlq_entry.entry.clone())
                .await
            {
                unresolved.push(dlq_entry);
            }
        }

        if let Err(e) = self.dlq.delete_file(path).await {
            warn!(error = %e, path = %path.display(), "failed to delete reprocessed dlq file, will retry whole file next cycle");
            self.bump_backoff(path).await;
            return;
        }

        if unresolved.is_empty() {
            self.file_state.lock().await.remove(path);
            info!(path = %path.display(), entries = total, "reprocessed dlq file");
            return;
        }

        // Entries that already made it back onto the ingress must not be
        // resubmitted on the next cycle, so the sealed file is gone for
        // good; anything still unresolved (ingress was backpressured) goes
        // back onto the live dlq stream instead of being retried in place.
        let unresolved_count = unresolved.len();
        for entry in unresolved {
            if let Err(e) = self.dlq.write(entry).await {
                warn!(error = %e, "dlq entry lost while requeuing after a partial reprocess");
            }
        }
        self.file_state.lock().await.remove(path);
        warn!(
            path = %path.display(),
            accepted = total - unresolved_count,
            unresolved = unresolved_count,
            "partially reprocessed dlq file, unresolved entries requeued"
        );
    }

    async fn bump_backoff(&self, path: &PathBuf) {
        let mut state = self.file_state.lock().await;
        let entry = state.entry(path.clone()).or_insert(FileState {
            attempt: 0,
            not_before: tokio::time::Instant::now(),
        });
        entry.attempt += 1;
        let delay = self.dlq.backoff_for_attempt(entry.attempt);
        entry.not_before = tokio::time::Instant::now() + delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{DedupConfig, DeduplicationCache};
    use crate::dispatcher::DispatcherConfig;
    use crate::dlq::DlqConfig;
    use crate::position::{PositionStore, PositionStoreConfig};
    use crate::sinks::{SendOutcome, Sink, SinkSet};
    use crate::types::{Batch, DlqEntry, FailureReasonTag, LogEntry, SourceId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSink {
        delivered: AtomicU64,
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        async fn send(&self, batch: &Batch) -> SendOutcome {
            self.delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
            SendOutcome::Success
        }
    }

    fn sample_entry(tag: FailureReasonTag, message: &str) -> DlqEntry {
        DlqEntry {
            entry: LogEntry::new(
                SourceId::for_file("/tmp/a.log"),
                message.into(),
                chrono::Utc::now(),
                Default::default(),
            ),
            failure_reason_tag: tag,
            first_failed_at: chrono::Utc::now(),
            attempt_history: vec!["attempt 1".into()],
            destination_sink: "loki".into(),
        }
    }

    #[tokio::test]
    async fn eligible_file_is_drained_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(Dlq::new(DlqConfig {
            dir: dir.path().join("dlq"),
            ..Default::default()
        }));
        let position_store = PositionStore::new(PositionStoreConfig {
            state_dir: dir.path().join("positions"),
            ..Default::default()
        });
        let sink = Arc::new(CountingSink { delivered: AtomicU64::new(0) });
        let sinks = Arc::new(SinkSet::new(vec![sink.clone() as Arc<dyn Sink>]));
        let dedup = Arc::new(DeduplicationCache::new(DedupConfig::default()));
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), dedup, sinks, position_store, dlq.clone());
        dispatcher.start().await;

        dlq.write(sample_entry(FailureReasonTag::ExhaustedRetries, "one")).await.unwrap();
        // force a rotation so the entry lands in a sealed file rather than
        // staying in the still-open active file.
        let active = dir.path().join("dlq").join("active.ndjson");
        let sealed = dir.path().join("dlq").join("sealed-1.ndjson");
        tokio::fs::rename(&active, &sealed).await.unwrap();

        let reprocessor = DlqReprocessor::new(ReprocessConfig::default(), dlq.clone(), dispatcher.clone());
        reprocessor.run_once().await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(!sealed.exists(), "sealed file should be deleted once fully reprocessed");
        assert_eq!(sink.delivered.load(Ordering::Relaxed), 1);
        dispatcher.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn file_with_a_permanent_entry_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(Dlq::new(DlqConfig {
            dir: dir.path().join("dlq"),
            ..Default::default()
        }));
        let position_store = PositionStore::new(PositionStoreConfig {
            state_dir: dir.path().join("positions"),
            ..Default::default()
        });
        let sink = Arc::new(CountingSink { delivered: AtomicU64::new(0) });
        let sinks = Arc::new(SinkSet::new(vec![sink.clone() as Arc<dyn Sink>]));
        let dedup = Arc::new(DeduplicationCache::new(DedupConfig::default()));
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), dedup, sinks, position_store, dlq.clone());

        dlq.write(sample_entry(FailureReasonTag::Permanent, "bad schema")).await.unwrap();
        let active = dir.path().join("dlq").join("active.ndjson");
        let sealed = dir.path().join("dlq").join("sealed-1.ndjson");
        tokio::fs::rename(&active, &sealed).await.unwrap();

        let reprocessor = DlqReprocessor::new(ReprocessConfig::default(), dlq.clone(), dispatcher.clone());
        reprocessor.run_once().await;

        assert!(sealed.exists(), "permanent entries must never be silently dropped");
        assert_eq!(sink.delivered.load(Ordering::Relaxed), 0);
    }
}
