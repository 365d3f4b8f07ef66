//! Dead-letter queue: append-only on-disk record of entries
//! that could not be delivered, with a reprocessing path that feeds them
//! back into the dispatcher's ingress point.
//!
//! Follows the event-router pattern used for other background republishing
//! tasks: drain one channel and feed it back into the same ingress the
//! original producers use — here the "republish" target is the
//! dispatcher's own `submit`.

pub mod reprocess;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{DlqEntry, FailureReasonTag};

#[derive(Clone, Debug)]
pub struct DlqConfig {
    pub dir: PathBuf,
    pub max_file_bytes: u64,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("dlq"),
            max_file_bytes: 64 * 1024 * 1024,
            initial_backoff: std::time::Duration::from_secs(30),
            max_backoff: std::time::Duration::from_secs(3600),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct OnDiskDlqEntry {
    entry: DlqEntry,
}

/// One append-only file per calendar day of writes, rotated on size. Each
/// line is one JSON-encoded [`DlqEntry`].
pub struct Dlq {
    config: DlqConfig,
    pub entries_written_total: AtomicU64,
}

impl Dlq {
    pub fn new(config: DlqConfig) -> Self {
        Self {
            config,
            entries_written_total: AtomicU64::new(0),
        }
    }

    fn active_file(&self) -> PathBuf {
        self.config.dir.join("active.ndjson")
    }

    pub async fn write(&self, entry: DlqEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.dir).await?;
        self.rotate_if_needed().await?;

        let line = serde_json::to_string(&OnDiskDlqEntry { entry })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_file())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
        self.entries_written_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rotate_if_needed(&self) -> Result<()> {
        let path = self.active_file();
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return Ok(());
        };
        if meta.len() < self.config.max_file_bytes {
            return Ok(());
        }
        let rotated = self
            .config
            .dir
            .join(format!("sealed-{}.ndjson", now_millis()));
        tokio::fs::rename(&path, &rotated).await?;
        info!(path = %rotated.display(), "rotated dlq file");
        Ok(())
    }

    /// Lists sealed (non-active) files oldest-first, the order reprocessing
    /// should drain them in.
    pub async fn sealed_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("sealed-") && name.ends_with(".ndjson") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Reads every entry out of `path` in file order. Callers decide
    /// reprocess eligibility per [`FailureReasonTag`] and feed survivors
    /// back into the dispatcher's ingress, bypassing the dedup cache (a DLQ
    /// entry is, by definition, not a duplicate of anything currently
    /// in-flight).
    pub async fn read_file(&self, path: &Path) -> Result<Vec<DlqEntry>> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<OnDiskDlqEntry>(trimmed) {
                Ok(on_disk) => entries.push(on_disk.entry),
                Err(e) => warn!(error = %e, path = %path.display(), "skipping malformed dlq line"),
            }
        }
        Ok(entries)
    }

    /// Whether a dead-lettered entry is worth ever reprocessing. Entries
    /// tagged `Permanent` (schema/timestamp rejection) stay dead; entries
    /// that merely exhausted the dispatcher's retry budget or were dropped
    /// under backpressure are retried indefinitely on a growing backoff.
    pub fn is_reprocess_eligible(tag: FailureReasonTag) -> bool {
        !matches!(tag, FailureReasonTag::Permanent)
    }

    /// Backoff before the next reprocess attempt for a file that has been
    /// retried `attempt` times already, doubling up to `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let scaled = self.config.initial_backoff.saturating_mul(1u32 << attempt.min(16));
        scaled.min(self.config.max_backoff)
    }

    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    /// Truncates a fully-drained file to zero length rather than deleting
    /// it mid-write, used when a reprocess pass consumes entries in place.
    pub async fn truncate_file(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(0).await?;
        let mut file = file;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureReasonTag, LogEntry, SourceId};

    fn sample_entry() -> DlqEntry {
        let log = LogEntry::new(
            SourceId::for_file("/tmp/a.log"),
            "boom".into(),
            chrono::Utc::now(),
            Default::default(),
        );
        DlqEntry {
            entry: log,
            failure_reason_tag: FailureReasonTag::ExhaustedRetries,
            first_failed_at: chrono::Utc::now(),
            attempt_history: vec!["timeout".into()],
            destination_sink: "loki".into(),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = Dlq::new(DlqConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        dlq.write(sample_entry()).await.unwrap();
        let entries = dlq.read_file(&dlq.active_file()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].destination_sink, "loki");
    }

    #[test]
    fn permanent_entries_are_not_reprocess_eligible() {
        assert!(!Dlq::is_reprocess_eligible(FailureReasonTag::Permanent));
        assert!(Dlq::is_reprocess_eligible(FailureReasonTag::ExhaustedRetries));
        assert!(Dlq::is_reprocess_eligible(FailureReasonTag::Dropped));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let dlq = Dlq::new(DlqConfig::default());
        let first = dlq.backoff_for_attempt(0);
        let second = dlq.backoff_for_attempt(1);
        assert_eq!(second, first * 2);
        let huge = dlq.backoff_for_attempt(100);
        assert_eq!(huge, dlq.config.max_backoff);
    }
}
