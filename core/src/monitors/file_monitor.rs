//! Tails plain files on disk: detects appends via
//! `notify-debouncer-full`, falls back to polling on filesystems that don't
//! support inotify (network mounts), and turns newly-appended bytes into
//! [`LogEntry`] values submitted to the dispatcher.
//!
//! Uses a debounced `notify` watcher plus a poll fallback selected by
//! inspecting `/proc/mounts`, and the same filesystem seam as
//! [`crate::monitors::fs`] for the read/stat calls. Rotation and truncation
//! handling (inode + size comparison, resetting the read cursor to 0) is
//! original to this component.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use notify_debouncer_full::{
    new_debouncer,
    notify::{self, RecommendedWatcher, RecursiveMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::monitors::fs::FileSystem;
use crate::position::PositionStore;
use crate::types::{Labels, LogEntry, PositionRecord, SourceCursor, SourceId};

/// How a monitor decides where to start reading a file it has never seen
/// a position record for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekStrategy {
    /// Start at EOF; only entries written after the monitor started show up.
    Recent,
    /// Start at byte 0 and read the whole file.
    FromStart,
}

/// How consecutive physical lines combine into one logical log entry.
#[derive(Clone)]
pub enum MultilineJoiner {
    /// Every physical line is its own entry.
    None,
    /// A line starts a new entry only if it matches `starts_new_entry`;
    /// everything else is appended to the entry currently being built
    /// (e.g. stack traces continuing a Java log line).
    RegexContinuation { starts_new_entry: Regex },
}

impl MultilineJoiner {
    fn starts_new_entry(&self, line: &str) -> bool {
        match self {
            MultilineJoiner::None => true,
            MultilineJoiner::RegexContinuation { starts_new_entry } => starts_new_entry.is_match(line),
        }
    }
}

/// Extracts a (timestamp, message) pair from one raw physical line before
/// it becomes a `LogEntry`, used by container log capture to unwrap
/// Docker's `{"log","stream","time"}` json-file format instead of treating
/// the raw JSON text as the message. Files with no parser
/// attached use the raw line verbatim and stamp it with the read wall
/// clock, same as before this hook existed.
pub type LineParser = Arc<dyn Fn(&str) -> Option<(DateTime<Utc>, String)> + Send + Sync>;

#[derive(Clone)]
pub struct FileMonitorConfig {
    pub poll_interval: Duration,
    pub debounce_timeout: Duration,
    pub read_chunk_bytes: usize,
    pub default_seek_strategy: SeekStrategy,
    /// How long a per-file read loop pauses once the dispatcher reports
    /// its ingress queue over the configured high-water mark, per spec
    /// §4.6's cooperative backpressure policy.
    pub backpressure_pause: Duration,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            debounce_timeout: Duration::from_millis(300),
            read_chunk_bytes: 1 << 20,
            default_seek_strategy: SeekStrategy::Recent,
            backpressure_pause: Duration::from_millis(250),
        }
    }
}

struct WatchedFile {
    labels: Labels,
    joiner: MultilineJoiner,
    line_parser: Option<LineParser>,
    /// Message, timestamp, and cumulative end-offset of the multiline
    /// entry currently being assembled (not yet submitted).
    pending_entry: Option<(String, chrono::DateTime<chrono::Utc>, u64)>,
    task: JoinHandle<()>,
    wake_tx: mpsc::Sender<()>,
    /// In-memory read progress, independent of the durable `PositionStore`
    /// record. Advances on every read regardless of delivery outcome;
    /// the durable record only advances once the dispatcher confirms an
    /// entry was accepted by a sink or written to the DLQ (spec I1).
    read_cursor: PositionRecord,
}

/// Owns one tokio task per watched file. Each task wakes on a debounced
/// filesystem event or a poll tick (network filesystems disable inotify, so
/// polling is the only signal there), re-stats the file, and reads forward
/// from the last known position.
pub struct FileMonitor {
    config: FileMonitorConfig,
    fs: Arc<dyn FileSystem>,
    dispatcher: Arc<Dispatcher>,
    position_store: Arc<PositionStore>,
    watched: Mutex<HashMap<PathBuf, WatchedFile>>,
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher, RecommendedCache>>>,
    shutdown: CancellationToken,
}

impl FileMonitor {
    pub fn new(
        config: FileMonitorConfig,
        fs: Arc<dyn FileSystem>,
        dispatcher: Arc<Dispatcher>,
        position_store: Arc<PositionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            fs,
            dispatcher,
            position_store,
            watched: Mutex::new(HashMap::new()),
            debouncer: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns whether `path` lives on a filesystem type known not to
    /// support inotify reliably (nfs, cifs, fuse), read from `/proc/mounts`.
    /// Such mounts use the poll-only fallback path instead of
    /// `notify-debouncer-full`.
    pub async fn is_network_filesystem(path: &Path) -> bool {
        let Ok(mounts) = tokio::fs::read_to_string("/proc/mounts").await else {
            return false;
        };
        let Ok(canonical) = tokio::fs::canonicalize(path).await else {
            return false;
        };
        let mut best_match: Option<(&str, &str)> = None;
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_device), Some(mount_point), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if canonical.to_string_lossy().starts_with(mount_point) {
                if best_match.map(|(mp, _)| mp.len() < mount_point.len()).unwrap_or(true) {
                    best_match = Some((mount_point, fstype));
                }
            }
        }
        matches!(best_match, Some((_, fstype)) if matches!(fstype, "nfs" | "nfs4" | "cifs" | "fuse" | "fuse.sshfs"))
    }

    /// Begins tailing `path`. If a [`PositionRecord`] already exists it
    /// resumes from there; otherwise applies `seek_strategy`.
    pub async fn add_file(
        self: &Arc<Self>,
        path: PathBuf,
        labels: Labels,
        joiner: MultilineJoiner,
        seek_strategy: Option<SeekStrategy>,
    ) -> crate::error::Result<()> {
        self.add_file_with_parser(path, labels, joiner, seek_strategy, None).await
    }

    /// Same as [`Self::add_file`] but additionally applies `line_parser` to
    /// every physical line before it is wrapped into a `LogEntry` — used to
    /// unwrap Docker's json-file log format when a container is routed here
    /// instead of to a streaming reader.
    pub async fn add_file_with_parser(
        self: &Arc<Self>,
        path: PathBuf,
        labels: Labels,
        joiner: MultilineJoiner,
        seek_strategy: Option<SeekStrategy>,
        line_parser: Option<LineParser>,
    ) -> crate::error::Result<()> {
        let source_id = SourceId::for_file(&path.to_string_lossy());
        let stat = self.fs.stat(&path).await?;

        let starting_record = match self.position_store.get(&source_id.0).await {
            Some(record) if !record.is_rotated_by(stat.inode, stat.size) => record,
            _ => {
                let strategy = seek_strategy.unwrap_or(self.config.default_seek_strategy);
                let byte_offset = match strategy {
                    SeekStrategy::Recent => stat.size,
                    SeekStrategy::FromStart => 0,
                };
                PositionRecord {
                    source_path: source_id.0.clone(),
                    inode: stat.inode,
                    size_at_read: stat.size,
                    byte_offset,
                    last_read_wall_time: chrono::Utc::now(),
                }
            }
        };
        // Establishes the durable baseline for this source (either the
        // previously-confirmed record, or a fresh one reflecting the seek
        // strategy). Reading ahead of this baseline never touches the
        // durable record again until the dispatcher confirms delivery;
        // see `read_cursor` below.
        self.position_store.set(starting_record.clone()).await;

        let (wake_tx, wake_rx) = mpsc::channel(4);
        self.register_watch(&path).await;

        let monitor = Arc::clone(self);
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            monitor.file_loop(task_path, wake_rx).await;
        });

        self.watched.lock().await.insert(
            path,
            WatchedFile {
                labels,
                joiner,
                line_parser,
                pending_entry: None,
                read_cursor: starting_record,
                task,
                wake_tx,
            },
        );
        Ok(())
    }

    async fn register_watch(self: &Arc<Self>, path: &Path) {
        if Self::is_network_filesystem(path).await {
            debug!(path = %path.display(), "network filesystem detected, using poll-only fallback");
            return;
        }

        let mut guard = self.debouncer.lock().await;
        if guard.is_none() {
            let (tx, rx) = mpsc::channel::<DebounceEventResult>(256);
            let debouncer = new_debouncer(self.config.debounce_timeout, None, move |result| {
                let _ = tx.blocking_send(result);
            });
            match debouncer {
                Ok(d) => {
                    *guard = Some(d);
                    let monitor = Arc::clone(self);
                    tokio::spawn(monitor.fan_out_debounced_events(rx));
                }
                Err(e) => {
                    warn!(error = %e, "failed to start filesystem watcher, falling back to polling");
                    return;
                }
            }
        }

        if let Some(debouncer) = guard.as_mut() {
            if let Err(e) = debouncer.watch(path, RecursiveMode::NonRecursive) {
                warn!(error = %e, path = %path.display(), "failed to watch path, falling back to polling");
            }
        }
    }

    /// Drains debounced filesystem events and nudges each affected file's
    /// poll loop, so appends are picked up well before the next poll tick
    /// instead of waiting out the full `poll_interval`.
    async fn fan_out_debounced_events(self: Arc<Self>, mut rx: mpsc::Receiver<DebounceEventResult>) {
        while let Some(result) = rx.recv().await {
            let Ok(events) = result else { continue };
            let watched = self.watched.lock().await;
            for event in events {
                for path in &event.event.paths {
                    if let Some(wf) = watched.get(path.as_path()) {
                        let _ = wf.wake_tx.try_send(());
                    }
                }
            }
        }
    }

    async fn file_loop(self: Arc<Self>, path: PathBuf, mut wake_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wake_rx.recv() => {}
            }

            if self.dispatcher.is_backpressured() {
                debug!(path = %path.display(), "dispatcher over high-water mark, pausing read");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.backpressure_pause) => {}
                }
            }

            if let Err(e) = self.poll_once(&path).await {
                warn!(error = %e, path = %path.display(), "file monitor poll failed");
            }
        }
    }

    /// Reads whatever has been appended since the in-memory `read_cursor`,
    /// independent of the durable `PositionStore` record. The durable
    /// record is only ever advanced by the dispatcher, once a sink or the
    /// DLQ has confirmed the entries built from these bytes (spec I1).
    async fn poll_once(&self, path: &Path) -> crate::error::Result<()> {
        let stat = match self.fs.stat(path).await {
            Ok(stat) => stat,
            Err(e) => {
                debug!(error = %e, path = %path.display(), "stat failed, file may have disappeared");
                return Ok(());
            }
        };

        let (read_from, to_read) = {
            let mut watched = self.watched.lock().await;
            let Some(watched_file) = watched.get_mut(path) else {
                return Ok(());
            };
            let cursor = &mut watched_file.read_cursor;
            if cursor.is_rotated_by(stat.inode, stat.size) {
                info!(path = %path.display(), "rotation or truncation detected, resetting cursor");
                cursor.inode = stat.inode;
                cursor.byte_offset = 0;
            }
            if stat.size <= cursor.byte_offset {
                return Ok(());
            }
            let to_read = (stat.size - cursor.byte_offset) as usize;
            (cursor.byte_offset, to_read.min(self.config.read_chunk_bytes))
        };

        let bytes = self.fs.read_range(path, read_from, to_read).await?;
        if bytes.is_empty() {
            return Ok(());
        }

        self.emit_lines(path, &bytes, read_from, stat.size).await;
        Ok(())
    }

    /// Splits `bytes` on newlines, applies the file's multiline joiner, and
    /// submits completed entries, stamping each with the `SourceCursor` it
    /// brings the read cursor to. Advances `read_cursor` up to the last
    /// complete line — a trailing partial line is left for the next poll.
    async fn emit_lines(&self, path: &Path, bytes: &[u8], base_offset: u64, stat_size: u64) {
        let text = String::from_utf8_lossy(bytes);
        let mut consumed = 0usize;
        let mut watched = self.watched.lock().await;
        let Some(watched_file) = watched.get_mut(path) else {
            return;
        };

        let source_id = SourceId::for_file(&path.to_string_lossy());
        let now = chrono::Utc::now();
        let inode = watched_file.read_cursor.inode;

        for line in text.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // partial trailing line, don't consume or emit it yet
                break;
            }
            consumed += line.len();
            let line = line.trim_end_matches('\n');
            let end_offset = base_offset + consumed as u64;

            if watched_file.joiner.starts_new_entry(line) {
                if let Some((message, timestamp, end_offset)) = watched_file.pending_entry.take() {
                    self.submit_entry(&source_id, message, timestamp, &watched_file.labels, inode, end_offset)
                        .await;
                }
                let parsed = watched_file.line_parser.as_ref().and_then(|parser| parser(line));
                let (message, timestamp) = match parsed {
                    Some((ts, msg)) => (msg, ts),
                    None => {
                        if watched_file.line_parser.is_some() {
                            warn!(path = %path.display(), "line parser failed to parse line, using raw text");
                        }
                        (line.to_string(), now)
                    }
                };
                watched_file.pending_entry = Some((message, timestamp, end_offset));
            } else if let Some((message, _, pending_end)) = watched_file.pending_entry.as_mut() {
                message.push('\n');
                message.push_str(line);
                *pending_end = end_offset;
            } else {
                watched_file.pending_entry = Some((line.to_string(), now, end_offset));
            }
        }

        watched_file.read_cursor.byte_offset = base_offset + consumed as u64;
        watched_file.read_cursor.size_at_read = stat_size;
        watched_file.read_cursor.last_read_wall_time = chrono::Utc::now();
    }

    async fn submit_entry(
        &self,
        source_id: &SourceId,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        labels: &Labels,
        inode: u64,
        end_offset: u64,
    ) {
        let mut entry = LogEntry::new(source_id.clone(), message, timestamp, labels.clone());
        entry.cursor = Some(SourceCursor { inode, end_offset });
        self.dispatcher.submit(entry).await;
    }

    /// Number of files currently tailed, i.e. tasks this monitor has live.
    pub async fn watched_file_count(&self) -> usize {
        self.watched.lock().await.len()
    }

    pub async fn remove_file(&self, path: &Path) {
        if let Some(watched) = self.watched.lock().await.remove(path) {
            watched.task.abort();
        }
        if let Some(debouncer) = self.debouncer.lock().await.as_mut() {
            let _ = debouncer.unwatch(path);
        }
    }

    /// Cancels every per-file task and waits up to `deadline` for them to
    /// finish flushing any pending multiline entry.
    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.cancel();
        let mut watched = self.watched.lock().await;
        let mut handles = Vec::new();
        for (path, mut wf) in watched.drain() {
            if let Some((message, timestamp, end_offset)) = wf.pending_entry.take() {
                let source_id = SourceId::for_file(&path.to_string_lossy());
                let mut entry = LogEntry::new(source_id, message, timestamp, wf.labels.clone());
                entry.cursor = Some(SourceCursor { inode: wf.read_cursor.inode, end_offset });
                self.dispatcher.submit(entry).await;
            }
            handles.push(wf.task);
        }
        drop(watched);

        let join_all = futures_util::future::join_all(handles);
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("file monitor shutdown deadline exceeded");
        }
    }

    /// In-memory read progress for `path`, as `(inode, byte_offset)`. The
    /// durable `PositionStore` record no longer tracks this once entries are
    /// in flight — only confirmed deliveries advance it — so tests that
    /// never run a dispatcher/sink need this to observe read progress.
    #[cfg(test)]
    async fn cursor_for(&self, path: &Path) -> Option<(u64, u64)> {
        self.watched
            .lock()
            .await
            .get(path)
            .map(|wf| (wf.read_cursor.inode, wf.read_cursor.byte_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DeduplicationCache;
    use crate::dlq::Dlq;
    use crate::monitors::fs::MemFs;
    use crate::sinks::SinkSet;

    async fn test_monitor() -> (Arc<FileMonitor>, Arc<MemFs>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(MemFs::new());
        let position_store = PositionStore::new(crate::position::PositionStoreConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let dlq = Arc::new(Dlq::new(crate::dlq::DlqConfig {
            dir: dir.path().join("dlq"),
            ..Default::default()
        }));
        let dedup = Arc::new(DeduplicationCache::new(Default::default()));
        let sinks = Arc::new(SinkSet::new(vec![]));
        let dispatcher = Dispatcher::new(Default::default(), dedup, sinks, position_store.clone(), dlq);
        let monitor = FileMonitor::new(FileMonitorConfig::default(), fs.clone(), dispatcher, position_store);
        (monitor, fs, dir)
    }

    #[tokio::test]
    async fn from_start_reads_existing_content() {
        let (monitor, fs, _dir) = test_monitor().await;
        let path = PathBuf::from("/var/log/app.log");
        fs.put(&path, 1, b"line one\nline two\n".to_vec()).await;

        monitor
            .add_file(path.clone(), Labels::new(), MultilineJoiner::None, Some(SeekStrategy::FromStart))
            .await
            .unwrap();
        monitor.poll_once(&path).await.unwrap();

        let (_, byte_offset) = monitor.cursor_for(&path).await.unwrap();
        assert_eq!(byte_offset, 18);
    }

    #[tokio::test]
    async fn rotation_resets_cursor_to_zero() {
        let (monitor, fs, _dir) = test_monitor().await;
        let path = PathBuf::from("/var/log/app.log");
        fs.put(&path, 1, b"first\n".to_vec()).await;
        monitor
            .add_file(path.clone(), Labels::new(), MultilineJoiner::None, Some(SeekStrategy::FromStart))
            .await
            .unwrap();
        monitor.poll_once(&path).await.unwrap();

        fs.put(&path, 2, b"after rotation\n".to_vec()).await;
        monitor.poll_once(&path).await.unwrap();

        let (inode, byte_offset) = monitor.cursor_for(&path).await.unwrap();
        assert_eq!(inode, 2);
        assert_eq!(byte_offset, 15);
    }

    #[test]
    fn regex_continuation_identifies_new_entries() {
        let joiner = MultilineJoiner::RegexContinuation {
            starts_new_entry: Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap(),
        };
        assert!(joiner.starts_new_entry("2024-01-01 started"));
        assert!(!joiner.starts_new_entry("  at com.example.Foo"));
    }
}
