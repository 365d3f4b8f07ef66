//! Startup and shutdown orchestration. Wires the position
//! store, dedup cache, sinks, dispatcher, and monitors together in
//! dependency order, and tears them down in reverse order with a bounded
//! deadline per stage.
//!
//! A `CancellationToken` is handed to every long-lived component, and each
//! stage's shutdown is joined with a timeout rather than awaited
//! unboundedly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dedup::{DedupConfig, DeduplicationCache};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::dlq::reprocess::{DlqReprocessor, ReprocessConfig};
use crate::dlq::{Dlq, DlqConfig};
use crate::metrics::{HealthReporter, HealthState, MetricsRegistry, NoopHealth, NoopMetrics};
use crate::monitors::container_monitor::ContainerMonitor;
use crate::monitors::file_monitor::{FileMonitor, FileMonitorConfig};
use crate::monitors::fs::{FileSystem, RealFs};
use crate::position::{PositionStore, PositionStoreConfig};
use crate::sinks::local_file::{LocalFileSink, LocalFileSinkConfig};
use crate::sinks::loki::{LokiSink, LokiSinkConfig};
use crate::sinks::{Sink, SinkSet};
use crate::timestamp::{TimestampLearner, TimestampLearnerConfig};

#[derive(Clone)]
pub struct SupervisorConfig {
    pub state_dir: PathBuf,
    pub dedup: DedupConfig,
    pub timestamp: TimestampLearnerConfig,
    pub dispatcher: DispatcherConfig,
    pub dlq_reprocess: ReprocessConfig,
    pub loki: Option<LokiSinkConfig>,
    pub local_file: Option<LocalFileSinkConfig>,
    pub shutdown_deadline: Duration,
    /// Reporting interval for the background metrics/health poller.
    pub metrics_report_interval: Duration,
    /// Collaborator-supplied registry. Defaults to a no-op sink
    /// so standalone runs and tests don't need to wire one in.
    pub metrics: Arc<dyn MetricsRegistry>,
    pub health: Arc<dyn HealthReporter>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/ingestd"),
            dedup: DedupConfig::default(),
            timestamp: TimestampLearnerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            dlq_reprocess: ReprocessConfig::default(),
            loki: Some(LokiSinkConfig::default()),
            local_file: Some(LocalFileSinkConfig::default()),
            shutdown_deadline: Duration::from_secs(15),
            metrics_report_interval: Duration::from_secs(10),
            metrics: Arc::new(NoopMetrics),
            health: Arc::new(NoopHealth),
        }
    }
}

/// Owns every long-lived component for the lifetime of the process. The
/// thin `agent` binary constructs one of these, calls `start`, waits for a
/// shutdown signal, then calls `shutdown`.
pub struct Supervisor {
    config: SupervisorConfig,
    pub position_store: Arc<PositionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub file_monitor: Arc<FileMonitor>,
    pub dedup: Arc<DeduplicationCache>,
    pub dlq: Arc<Dlq>,
    pub timestamp_learner: Arc<TimestampLearner>,
    loki_sink: Option<Arc<LokiSink>>,
    shutdown: CancellationToken,
    committer_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    metrics_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    dlq_reprocessor: Arc<DlqReprocessor>,
    reprocess_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    dedup_sweeper_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Set by the caller once a `ContainerMonitor` has been constructed
    /// (it depends on `dispatcher`/`file_monitor`, both already owned by
    /// `self`, so it cannot be built before `Supervisor::new` returns).
    container_monitor: tokio::sync::Mutex<Option<Arc<ContainerMonitor>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> crate::error::Result<Arc<Self>> {
        let position_store = PositionStore::new(PositionStoreConfig {
            state_dir: config.state_dir.join("positions"),
            ..Default::default()
        });

        let dlq = Arc::new(Dlq::new(DlqConfig {
            dir: config.state_dir.join("dlq"),
            ..Default::default()
        }));

        let dedup = Arc::new(DeduplicationCache::new(config.dedup.clone()));
        let timestamp_learner = Arc::new(TimestampLearner::new(config.timestamp.clone()));

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        let mut loki_sink: Option<Arc<LokiSink>> = None;
        if let Some(loki_config) = &config.loki {
            let sink = Arc::new(LokiSink::new(loki_config.clone(), Arc::clone(&timestamp_learner))?);
            sinks.push(sink.clone());
            loki_sink = Some(sink);
        }
        if let Some(local_config) = &config.local_file {
            sinks.push(Arc::new(LocalFileSink::new(local_config.clone())));
        }
        let sinks = Arc::new(SinkSet::new(sinks));

        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            Arc::clone(&dedup),
            Arc::clone(&sinks),
            Arc::clone(&position_store),
            Arc::clone(&dlq),
        );

        let fs: Arc<dyn FileSystem> = Arc::new(RealFs);
        let file_monitor = FileMonitor::new(
            FileMonitorConfig::default(),
            fs,
            Arc::clone(&dispatcher),
            Arc::clone(&position_store),
        );

        let dlq_reprocessor = DlqReprocessor::new(
            config.dlq_reprocess.clone(),
            Arc::clone(&dlq),
            Arc::clone(&dispatcher),
        );

        Ok(Arc::new(Self {
            config,
            position_store,
            dispatcher,
            file_monitor,
            dedup,
            dlq,
            timestamp_learner,
            loki_sink,
            shutdown: CancellationToken::new(),
            committer_handle: tokio::sync::Mutex::new(None),
            metrics_task: tokio::sync::Mutex::new(None),
            dlq_reprocessor,
            reprocess_task: tokio::sync::Mutex::new(None),
            dedup_sweeper_task: tokio::sync::Mutex::new(None),
            container_monitor: tokio::sync::Mutex::new(None),
        }))
    }

    /// Registers a `ContainerMonitor` so the periodic metrics reporter can
    /// publish its stream-rotation/liveness counters alongside the rest of
    /// the component set. Constructed and started by the caller (it needs
    /// `self.dispatcher`/`self.file_monitor`, which only exist after `new`
    /// returns).
    pub async fn attach_container_monitor(&self, monitor: Arc<ContainerMonitor>) {
        *self.container_monitor.lock().await = Some(monitor);
    }

    /// Loads persisted state and starts the dispatcher worker pool, the
    /// position store's background committer, and the metrics/health
    /// reporter. Monitors are attached by the caller afterward via
    /// `self.file_monitor.add_file`/`ContainerMonitor`.
    pub async fn start(self: &Arc<Self>) -> crate::error::Result<()> {
        self.position_store.load().await?;
        *self.committer_handle.lock().await = Some(self.position_store.spawn_committer());
        self.dispatcher.start().await;
        *self.metrics_task.lock().await = Some(self.spawn_metrics_reporter());
        *self.reprocess_task.lock().await = Some(self.dlq_reprocessor.spawn(self.shutdown.clone()));
        *self.dedup_sweeper_task.lock().await = Some(self.dedup.spawn_sweeper(self.shutdown.clone()));
        info!("supervisor started");
        Ok(())
    }

    /// Periodically translates each component's internal counters into the
    /// registry's named metrics and publishes a health snapshot per
    /// component, the interface the (out-of-scope) admin/Prometheus
    /// collaborator consumes.
    fn spawn_metrics_reporter(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.metrics_report_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = ticker.tick() => supervisor.report_metrics_once().await,
                }
            }
        })
    }

    async fn report_metrics_once(&self) {
        use std::sync::atomic::Ordering;

        let metrics = &self.config.metrics;
        let health = &self.config.health;

        metrics.incr_counter(
            "logs_processed_total",
            &[],
            self.dispatcher.entries_delivered.swap(0, Ordering::Relaxed),
        );
        metrics.incr_counter(
            "logs_deduplicated_total",
            &[],
            self.dedup.suppressed_total.swap(0, Ordering::Relaxed),
        );
        metrics.incr_counter(
            "dlq_entries_total",
            &[],
            self.dlq.entries_written_total.swap(0, Ordering::Relaxed),
        );
        metrics.incr_counter(
            "position_corruptions_detected_total",
            &[],
            self.position_store.corruptions_detected.swap(0, Ordering::Relaxed),
        );
        metrics.incr_counter(
            "timestamp_rejection_total",
            &[("reason", "clamped")],
            self.timestamp_learner.clamped_total.swap(0, Ordering::Relaxed),
        );
        metrics.incr_counter(
            "timestamp_rejection_total",
            &[("reason", "rejected")],
            self.timestamp_learner.rejected_total.swap(0, Ordering::Relaxed),
        );
        metrics.set_gauge(
            "timestamp_max_acceptable_age_seconds",
            &[],
            self.timestamp_learner.current_max_age().await.num_seconds(),
        );
        metrics.set_gauge(
            "dispatcher_queue_size",
            &[],
            (self.dispatcher.entries_submitted.load(Ordering::Relaxed) as i64
                - self.dispatcher.entries_delivered.load(Ordering::Relaxed) as i64)
                .max(0),
        );

        if let Some(loki) = &self.loki_sink {
            metrics.incr_counter("http_requests_total", &[], loki.requests_total.swap(0, Ordering::Relaxed));
            metrics.incr_counter(
                "http_errors_total",
                &[("error_type", "http")],
                loki.http_errors_total.swap(0, Ordering::Relaxed),
            );
            metrics.set_gauge("http_idle_connections", &[], loki.idle_connection_slots() as i64);
            let state = if loki.is_healthy().await {
                HealthState::Up
            } else {
                HealthState::Degraded
            };
            health.report("loki_sink", state, None);
        }

        let position_state = if self.position_store.is_degraded() {
            HealthState::Degraded
        } else {
            HealthState::Up
        };
        health.report(
            "position_store",
            position_state,
            self.position_store.is_degraded().then_some("PERSIST_IO"),
        );

        let mut task_count = self.dispatcher.worker_count().await + self.file_monitor.watched_file_count().await;
        if let Some(container_monitor) = self.container_monitor.lock().await.as_ref() {
            metrics.incr_counter(
                "stream_rotations_total",
                &[],
                container_monitor.rotations_total.swap(0, Ordering::Relaxed),
            );
            metrics.observe_histogram(
                "stream_age_seconds",
                &[],
                container_monitor.last_stream_age_seconds.load(Ordering::Relaxed) as f64,
            );
            task_count += container_monitor.active_stream_count().await;
        }
        metrics.set_gauge("goroutines", &[], task_count as i64);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels every component and joins them in reverse startup order,
    /// each bounded by `shutdown_deadline` so a single wedged component
    /// can't hang the whole process exit.
    pub async fn shutdown(&self) {
        info!("supervisor shutdown initiated");
        self.shutdown.cancel();

        self.file_monitor.stop(self.config.shutdown_deadline).await;
        // Drains remaining retry/ingress items to the DLQ and flushes every
        // configured sink (spec §4.9 steps 2-3) before this returns.
        self.dispatcher.shutdown(self.config.shutdown_deadline).await;

        if let Err(e) = self.position_store.close().await {
            warn!(error = %e, "final position flush failed during shutdown");
        }
        if let Some(handle) = self.committer_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.metrics_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.reprocess_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.dedup_sweeper_task.lock().await.take() {
            handle.abort();
        }

        info!("supervisor shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(SupervisorConfig {
            state_dir: dir.path().to_path_buf(),
            loki: None,
            local_file: Some(LocalFileSinkConfig {
                dir: dir.path().join("local-sink"),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();

        supervisor.start().await.unwrap();
        supervisor.report_metrics_once().await;
        supervisor.shutdown().await;
    }
}
