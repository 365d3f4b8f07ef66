//! Hybrid container log capture: discovers running containers
//! through the Docker Engine API, routes `json-file`-logging containers to
//! [`FileMonitor`] against their on-disk log file, and falls back to
//! short-lived rotating HTTP log streams for every other log driver.
//!
//! Uses `bollard` for Docker Engine API access, combined with the same
//! `CancellationToken` + wait-group shutdown discipline used by the rest of
//! this crate's long-lived components.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::container::{InspectContainerOptions, ListContainersOptions, LogsOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::monitors::file_monitor::{FileMonitor, LineParser, MultilineJoiner, SeekStrategy};
use crate::types::{Labels, LogEntry, SourceId};

#[derive(Clone, Debug)]
pub struct ContainerMonitorConfig {
    /// Upper bound on how long a single fallback HTTP log stream stays
    /// open before it is closed and reopened with an updated `since`
    /// cursor. Keeps a single long-lived connection from silently wedging.
    pub stream_max_lifetime: Duration,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_max: Duration,
    pub discovery_interval: Duration,
}

impl Default for ContainerMonitorConfig {
    fn default() -> Self {
        Self {
            stream_max_lifetime: Duration::from_secs(300),
            reconnect_backoff_initial: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(15),
        }
    }
}

/// One JSON-encoded line from Docker's `json-file` log driver.
#[derive(Deserialize)]
struct JsonFileLogLine {
    log: String,
    #[allow(dead_code)]
    stream: String,
    time: String,
}

struct TrackedContainer {
    last_since: i64,
    stream_task: Option<JoinHandle<()>>,
}

/// Discovers containers, and for each either hands its log file to a
/// [`FileMonitor`] (preferred: no HTTP connection held open) or spawns a
/// bounded-lifetime streaming task against the Docker API.
pub struct ContainerMonitor {
    config: ContainerMonitorConfig,
    docker: Docker,
    dispatcher: Arc<Dispatcher>,
    file_monitor: Arc<FileMonitor>,
    tracked: Mutex<HashMap<String, TrackedContainer>>,
    shutdown: CancellationToken,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    /// Count of stream close-then-reopen cycles (`stream_rotations_total`),
    /// zero for containers routed through `FileMonitor` instead.
    pub rotations_total: AtomicU64,
    /// Most recently observed stream lifetime in seconds
    /// (`stream_age_seconds` histogram sample).
    pub last_stream_age_seconds: AtomicU64,
}

impl ContainerMonitor {
    pub fn new(
        config: ContainerMonitorConfig,
        docker: Docker,
        dispatcher: Arc<Dispatcher>,
        file_monitor: Arc<FileMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            docker,
            dispatcher,
            file_monitor,
            tracked: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            discovery_task: Mutex::new(None),
            rotations_total: AtomicU64::new(0),
            last_stream_age_seconds: AtomicU64::new(0),
        })
    }

    /// Number of containers currently routed through a streaming task
    /// (as opposed to `FileMonitor`'s json-file path).
    pub async fn active_stream_count(&self) -> usize {
        self.tracked.lock().await.len()
    }

    pub async fn start(self: &Arc<Self>) -> crate::error::Result<()> {
        self.discover_and_attach().await?;

        let monitor = Arc::clone(self);
        let discovery = tokio::spawn(async move {
            monitor.discovery_loop().await;
        });
        *self.discovery_task.lock().await = Some(discovery);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.event_loop().await;
        });
        Ok(())
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.discover_and_attach().await {
                        warn!(error = %e, "container discovery failed");
                    }
                }
            }
        }
    }

    /// Subscribes to Docker lifecycle events so new/restarted containers
    /// get attached promptly rather than waiting for the next discovery
    /// tick, reconnecting on a growing backoff if the event stream drops.
    async fn event_loop(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_backoff_initial;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let mut stream = self.docker.events(Some(EventsOptions::<String> {
                filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
                ..Default::default()
            }));

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            Some(Ok(_event)) => {
                                backoff = self.config.reconnect_backoff_initial;
                                if let Err(e) = self.discover_and_attach().await {
                                    warn!(error = %e, "container discovery after event failed");
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "docker event stream error, reconnecting");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.reconnect_backoff_max);
        }
    }

    async fn discover_and_attach(&self) -> crate::error::Result<()> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        for summary in containers {
            let Some(id) = summary.id.clone() else { continue };
            if self.tracked.lock().await.contains_key(&id) {
                continue;
            }
            if let Err(e) = self.attach(&id).await {
                warn!(error = %e, container_id = %id, "failed to attach to container");
            }
        }
        Ok(())
    }

    async fn attach(&self, container_id: &str) -> crate::error::Result<()> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        let name = inspect.name.clone().unwrap_or_default();
        let log_driver = inspect
            .host_config
            .as_ref()
            .and_then(|hc| hc.log_config.as_ref())
            .and_then(|lc| lc.typ.as_ref())
            .cloned()
            .unwrap_or_else(|| "json-file".to_string());

        let mut labels = Labels::new();
        labels.insert("container_name".to_string(), name.trim_start_matches('/').to_string());
        labels.insert("container_id".to_string(), container_id.to_string());
        if let Some(image) = &inspect.config.as_ref().and_then(|c| c.image.clone()) {
            labels.insert("container_image".to_string(), image.clone());
        }

        if log_driver == "json-file" {
            if let Some(log_path) = inspect.log_path.clone() {
                info!(container_id, log_path, "routing container to file monitor (json-file driver)");
                let parser: LineParser = Arc::new(|line: &str| Self::parse_json_file_line(line));
                self.file_monitor
                    .add_file_with_parser(
                        PathBuf::from(log_path),
                        labels,
                        MultilineJoiner::None,
                        Some(SeekStrategy::Recent),
                        Some(parser),
                    )
                    .await?;
                self.tracked.lock().await.insert(
                    container_id.to_string(),
                    TrackedContainer {
                        last_since: chrono::Utc::now().timestamp(),
                        stream_task: None,
                    },
                );
                return Ok(());
            }
        }

        info!(container_id, log_driver, "falling back to streaming logs via docker API");
        self.spawn_stream(container_id.to_string(), labels).await;
        Ok(())
    }

    /// Opens a log stream bounded to `stream_max_lifetime`, then closes it
    /// and reopens with an updated `since` cursor. Each reopen waits for
    /// the previous stream's task to fully join before starting the next,
    /// so two readers never race on the same container's log offset.
    async fn spawn_stream(self: &Arc<Self>, container_id: String, labels: Labels) {
        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut since = chrono::Utc::now().timestamp();
            let mut first = true;
            loop {
                if monitor.shutdown.is_cancelled() {
                    break;
                }
                let opened_at = Instant::now();
                since = monitor.stream_once(&container_id, &labels, since).await;
                monitor
                    .last_stream_age_seconds
                    .store(opened_at.elapsed().as_secs(), Ordering::Relaxed);
                if !first {
                    monitor.rotations_total.fetch_add(1, Ordering::Relaxed);
                }
                first = false;
                if monitor.shutdown.is_cancelled() {
                    break;
                }
            }
        });

        self.tracked.lock().await.insert(
            container_id,
            TrackedContainer {
                last_since: chrono::Utc::now().timestamp(),
                stream_task: Some(task),
            },
        );
    }

    /// Streams logs for up to `stream_max_lifetime`, returning the `since`
    /// cursor the next stream should resume from.
    async fn stream_once(&self, container_id: &str, labels: &Labels, since: i64) -> i64 {
        let source_id = SourceId::for_container(container_id);
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since,
            timestamps: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let deadline = tokio::time::sleep(self.config.stream_max_lifetime);
        tokio::pin!(deadline);
        let mut latest_since = since;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut deadline => {
                    debug!(container_id, "rotating container log stream");
                    break;
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(output)) => {
                            let raw = output.to_string();
                            if let Some((ts, message)) = split_docker_timestamp(&raw) {
                                latest_since = ts.timestamp();
                                let entry = LogEntry::new(source_id.clone(), message, ts, labels.clone());
                                self.dispatcher.submit(entry).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, container_id, "container log stream error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        latest_since
    }

    /// Parses one `{"log","stream","time"}` line emitted by the json-file
    /// driver, used when reading a routed container's log file directly
    /// rather than through the Docker API.
    pub fn parse_json_file_line(line: &str) -> Option<(chrono::DateTime<chrono::Utc>, String)> {
        let parsed: JsonFileLogLine = serde_json::from_str(line).ok()?;
        let ts = chrono::DateTime::parse_from_rfc3339(&parsed.time)
            .ok()?
            .with_timezone(&chrono::Utc);
        Some((ts, parsed.log.trim_end_matches('\n').to_string()))
    }

    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.cancel();
        if let Some(task) = self.discovery_task.lock().await.take() {
            task.abort();
        }
        let mut tracked = self.tracked.lock().await;
        let handles: Vec<_> = tracked
            .values_mut()
            .filter_map(|t| t.stream_task.take())
            .collect();
        drop(tracked);

        let join_all = futures_util::future::join_all(handles);
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("container monitor shutdown deadline exceeded");
        }
    }
}

/// Docker's `timestamps: true` output prefixes each line with an RFC3339
/// timestamp followed by a space.
fn split_docker_timestamp(raw: &str) -> Option<(chrono::DateTime<chrono::Utc>, String)> {
    let (ts_str, rest) = raw.split_once(' ')?;
    let ts = chrono::DateTime::parse_from_rfc3339(ts_str)
        .ok()?
        .with_timezone(&chrono::Utc);
    Some((ts, rest.trim_end_matches('\n').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_timestamped_line() {
        let raw = "2024-01-01T00:00:00.000000000Z hello world\n";
        let (ts, message) = split_docker_timestamp(raw).unwrap();
        assert_eq!(message, "hello world");
        assert_eq!(ts.timestamp(), 1704067200);
    }

    #[test]
    fn parses_json_file_driver_line() {
        let line = r#"{"log":"hi there\n","stream":"stdout","time":"2024-01-01T00:00:00.000000000Z"}"#;
        let (ts, message) = ContainerMonitor::parse_json_file_line(line).unwrap();
        assert_eq!(message, "hi there");
        assert_eq!(ts.timestamp(), 1704067200);
    }

    #[test]
    fn rejects_malformed_json_file_line() {
        assert!(ContainerMonitor::parse_json_file_line("not json").is_none());
    }
}
