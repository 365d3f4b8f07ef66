//! Secondary sink: appends every batch to a local newline-delimited JSON
//! file, rotating by size. Exists so an operator can recover entries that
//! never reached the remote destination without having gone through the DLQ
//!: a write failure is retried up to `max_consecutive_failures`
//! times (a disk hiccup, a transient `ENOSPC`) before escalating to
//! `Permanent` once it looks like the disk itself is the problem.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::{SendOutcome, Sink};
use crate::types::Batch;

#[derive(Clone, Debug)]
pub struct LocalFileSinkConfig {
    pub dir: PathBuf,
    pub max_file_bytes: u64,
    /// Consecutive write failures tolerated before escalating from
    /// `Retryable` to `Permanent`.
    pub max_consecutive_failures: u32,
}

impl Default for LocalFileSinkConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("local-sink"),
            max_file_bytes: 256 * 1024 * 1024,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Serialize)]
struct LineRecord<'a> {
    source: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
    message: &'a str,
    labels: &'a crate::types::Labels,
}

pub struct LocalFileSink {
    config: LocalFileSinkConfig,
    generation: AtomicU64,
    write_lock: Mutex<()>,
    consecutive_failures: AtomicU64,
}

impl LocalFileSink {
    pub fn new(config: LocalFileSinkConfig) -> Self {
        Self {
            config,
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    fn active_path(&self) -> PathBuf {
        self.config
            .dir
            .join(format!("entries-{}.ndjson", self.generation.load(Ordering::Relaxed)))
    }

    async fn write_batch(&self, batch: &Batch) -> crate::error::Result<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.config.dir).await?;

        if let Ok(meta) = tokio::fs::metadata(self.active_path()).await {
            if meta.len() >= self.config.max_file_bytes {
                self.generation.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())
            .await?;

        let mut buf = String::new();
        for entry in &batch.entries {
            let record = LineRecord {
                source: &entry.source_id.0,
                timestamp: entry.timestamp,
                message: &entry.message,
                labels: &entry.labels,
            };
            buf.push_str(&serde_json::to_string(&record)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink for LocalFileSink {
    fn name(&self) -> &str {
        "local_file"
    }

    async fn send(&self, batch: &Batch) -> SendOutcome {
        match self.write_batch(batch).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                SendOutcome::Success
            }
            Err(e) => {
                let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if streak > self.config.max_consecutive_failures as u64 {
                    warn!(error = %e, streak, "local file sink write failed repeatedly, escalating to permanent");
                    SendOutcome::Permanent
                } else {
                    warn!(error = %e, streak, "local file sink write failed, will retry");
                    SendOutcome::Retryable
                }
            }
        }
    }

    /// Waits for any in-flight write to finish before shutdown drops the
    /// sink, so a final batch isn't torn down mid-write.
    async fn close(&self) {
        let _guard = self.write_lock.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogEntry, SourceId};

    #[tokio::test]
    async fn writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalFileSink::new(LocalFileSinkConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut batch = Batch::new();
        batch.push(LogEntry::new(
            SourceId::for_file("/a"),
            "hello".into(),
            chrono::Utc::now(),
            Default::default(),
        ));
        batch.push(LogEntry::new(
            SourceId::for_file("/a"),
            "world".into(),
            chrono::Utc::now(),
            Default::default(),
        ));
        assert_eq!(sink.send(&batch).await, SendOutcome::Success);

        let contents = tokio::fs::read_to_string(sink.active_path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn rotates_once_size_cap_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalFileSink::new(LocalFileSinkConfig {
            dir: dir.path().to_path_buf(),
            max_file_bytes: 1,
        });
        let mut batch = Batch::new();
        batch.push(LogEntry::new(
            SourceId::for_file("/a"),
            "first".into(),
            chrono::Utc::now(),
            Default::default(),
        ));
        sink.send(&batch).await;
        sink.send(&batch).await;
        assert_eq!(sink.generation.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn write_failures_retry_then_escalate_to_permanent() {
        // point at a directory that can never be created (its parent is a
        // file, not a directory) so every write fails deterministically.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"not a directory").await.unwrap();

        let sink = LocalFileSink::new(LocalFileSinkConfig {
            dir: blocker.join("nested"),
            max_consecutive_failures: 2,
            ..LocalFileSinkConfig::default()
        });
        let mut batch = Batch::new();
        batch.push(LogEntry::new(
            SourceId::for_file("/a"),
            "hello".into(),
            chrono::Utc::now(),
            Default::default(),
        ));

        assert_eq!(sink.send(&batch).await, SendOutcome::Retryable);
        assert_eq!(sink.send(&batch).await, SendOutcome::Retryable);
        assert_eq!(sink.send(&batch).await, SendOutcome::Permanent);
    }
}
