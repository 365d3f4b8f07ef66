//! Crash-safe persistence of `(source -> byte offset, inode, size)` (spec
//! §4.1). Uses the usual atomic tmp-file-then-rename idiom
//! (`File::create(tmp)` -> `write_all` -> `sync_all` -> `std::fs::rename`),
//! generalized to a JSON-shaped map plus N rotating checkpoint generations
//! instead of a single binary index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, IngestError, Result};
use crate::types::PositionRecord;

#[derive(Clone, Debug)]
pub struct PositionStoreConfig {
    pub state_dir: PathBuf,
    pub flush_interval: std::time::Duration,
    pub checkpoint_generations: usize,
}

impl Default for PositionStoreConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            flush_interval: std::time::Duration::from_secs(10),
            checkpoint_generations: 3,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct OnDiskRecords {
    records: HashMap<String, PositionRecord>,
}

/// Maintains one record per watched file, flushed on an interval and on
/// shutdown. Falls back to memory-only operation (with a health warning)
/// when disk writes fail (`PERSIST_IO`).
pub struct PositionStore {
    config: PositionStoreConfig,
    records: RwLock<HashMap<String, PositionRecord>>,
    dirty: std::sync::atomic::AtomicBool,
    next_generation: AtomicU64,
    pub corruptions_detected: Arc<AtomicU64>,
    degraded: std::sync::atomic::AtomicBool,
    shutdown: CancellationToken,
}

impl PositionStore {
    pub fn new(config: PositionStoreConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: RwLock::new(HashMap::new()),
            dirty: std::sync::atomic::AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            corruptions_detected: Arc::new(AtomicU64::new(0)),
            degraded: std::sync::atomic::AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn main_path(&self) -> PathBuf {
        self.config.state_dir.join("positions.json")
    }

    fn tmp_path(&self) -> PathBuf {
        self.config.state_dir.join("positions.json.tmp")
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.config.state_dir.join("checkpoints")
    }

    fn checkpoint_path(&self, generation: usize) -> PathBuf {
        self.checkpoint_dir().join(format!("gen_{generation}.json"))
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Loads `positions.json`; on parse failure, tries checkpoint
    /// generations newest-first.
    pub async fn load(&self) -> Result<()> {
        match self.try_load(&self.main_path()).await {
            Ok(records) => {
                *self.records.write().await = records;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "positions.json unreadable, trying checkpoints");
            }
        }

        self.corruptions_detected.fetch_add(1, Ordering::Relaxed);

        let generations = self.config.checkpoint_generations.max(1);
        for offset in 0..generations {
            // newest-first: next_generation points at the slot that will be
            // written next, so the most recent completed write is one behind it.
            let idx = (self.next_generation.load(Ordering::Relaxed) as usize + generations
                - 1
                - offset)
                % generations;
            let path = self.checkpoint_path(idx);
            if let Ok(records) = self.try_load(&path).await {
                info!(generation = idx, "recovered positions from checkpoint");
                *self.records.write().await = records;
                return Ok(());
            }
        }

        warn!("no usable position state found, starting from empty");
        *self.records.write().await = HashMap::new();
        Ok(())
    }

    async fn try_load(&self, path: &Path) -> Result<HashMap<String, PositionRecord>> {
        let bytes = tokio::fs::read(path).await?;
        let on_disk: OnDiskRecords = serde_json::from_slice(&bytes)?;
        Ok(on_disk.records)
    }

    pub async fn get(&self, path: &str) -> Option<PositionRecord> {
        self.records.read().await.get(path).cloned()
    }

    /// Sets the in-memory record. Callers are responsible for resetting
    /// `byte_offset` to 0 when they detect rotation/truncation — the store
    /// itself does not detect this.
    pub async fn set(&self, record: PositionRecord) {
        self.records
            .write()
            .await
            .insert(record.source_path.clone(), record);
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let snapshot = OnDiskRecords {
            records: self.records.read().await.clone(),
        };

        match self.write_atomic(&snapshot).await {
            Ok(()) => {
                self.degraded.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                error!(error = %e, "position store flush failed, degrading to memory-only");
                Err(IngestError::classified(
                    ErrorKind::IoWrite,
                    format!("PERSIST_IO: {e}"),
                ))
            }
        }
    }

    async fn write_atomic(&self, snapshot: &OnDiskRecords) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.state_dir).await?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        {
            let f = tokio::fs::File::open(&tmp).await?;
            f.sync_all().await?;
        }
        tokio::fs::rename(&tmp, self.main_path()).await?;

        tokio::fs::create_dir_all(self.checkpoint_dir()).await?;
        let generations = self.config.checkpoint_generations.max(1) as u64;
        let gen_idx = self.next_generation.fetch_add(1, Ordering::Relaxed) % generations;
        tokio::fs::write(self.checkpoint_path(gen_idx as usize), &bytes).await?;

        debug!(generation = gen_idx, "position checkpoint written");
        Ok(())
    }

    /// Background committer: flushes on `flush_interval` until cancelled.
    pub fn spawn_committer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = interval(store.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush().await {
                            warn!(error = %e, "periodic position flush failed");
                        }
                    }
                }
            }
        })
    }

    /// Cancels the background committer and performs a final flush.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(PositionStoreConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let rec = PositionRecord {
            source_path: "/tmp/a.log".into(),
            inode: 7,
            size_at_read: 100,
            byte_offset: 42,
            last_read_wall_time: chrono::Utc::now(),
        };
        store.set(rec.clone()).await;
        assert_eq!(store.get("/tmp/a.log").await, Some(rec));
    }

    #[tokio::test]
    async fn flush_then_reload_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PositionStoreConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = PositionStore::new(cfg.clone());
        let rec = PositionRecord {
            source_path: "/tmp/a.log".into(),
            inode: 7,
            size_at_read: 100,
            byte_offset: 42,
            last_read_wall_time: chrono::Utc::now(),
        };
        store.set(rec.clone()).await;
        store.flush().await.unwrap();

        let reloaded = PositionStore::new(cfg);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("/tmp/a.log").await, Some(rec));
    }

    #[tokio::test]
    async fn corrupt_main_file_falls_back_to_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PositionStoreConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = PositionStore::new(cfg.clone());
        let rec = PositionRecord {
            source_path: "/tmp/a.log".into(),
            inode: 1,
            size_at_read: 10,
            byte_offset: 10,
            last_read_wall_time: chrono::Utc::now(),
        };
        store.set(rec.clone()).await;
        store.flush().await.unwrap();

        tokio::fs::write(store.main_path(), b"{not json").await.unwrap();

        let reloaded = PositionStore::new(cfg);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("/tmp/a.log").await, Some(rec));
        assert_eq!(reloaded.corruptions_detected.load(Ordering::Relaxed), 1);
    }
}
