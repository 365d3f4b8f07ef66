//! Core data model shared across monitors, the dispatcher, and sinks.
//!
//! `LogEntry` is the unit of work; everything else either describes where
//! it came from (`PositionRecord`, `ContainerLogInfo`) or how it is grouped
//! for delivery (`Batch`, `DLQEntry`).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a log source: a file path or a container id,
/// prefixed so the two namespaces never collide (`file:/var/log/a.log`,
/// `container:ab12cd34`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn for_file(path: &str) -> Self {
        Self(format!("file:{path}"))
    }

    pub fn for_container(container_id: &str) -> Self {
        Self(format!("container:{container_id}"))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered label map. `BTreeMap` (not `HashMap`) so stream-key construction
/// in the Loki sink gets a deterministic iteration order for free.
pub type Labels = BTreeMap<String, String>;

/// Internal identity used for DLQ cross-referencing and log correlation.
/// Never serialized to a sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stable 64-bit fingerprint used for short-term duplicate suppression.
/// Collisions are tolerated — dedup is an optimisation, not a correctness
/// requirement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Hash over `(source_id, message, truncated-timestamp)`. Timestamp is
    /// truncated to whole seconds so near-duplicate entries within the
    /// same second collapse.
    pub fn compute(source_id: &SourceId, message: &str, timestamp: DateTime<Utc>) -> Self {
        use std::hash::Hasher;
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(source_id.0.as_bytes());
        hasher.write(message.as_bytes());
        hasher.write_i64(timestamp.timestamp());
        Self(hasher.finish())
    }
}

/// Marks where in a file-backed source's byte stream an entry ends, so a
/// confirmed delivery can be mapped back to a durable `PositionRecord`
/// advance. `inode` pins the cursor to the file generation it was read
/// from — a confirmation only advances the durable record when its
/// `inode` still matches, so a rotation between read and delivery can't
/// advance the new generation's offset using the old one's bytes.
///
/// `None` on `LogEntry` for sources that don't track byte offsets at all
/// (the container monitor's streaming fallback, which resumes by
/// timestamp instead).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceCursor {
    pub inode: u64,
    pub end_offset: u64,
}

/// Unit of work flowing from a monitor through the dispatcher to a sink.
///
/// Ownership: exclusively owned by whichever component currently holds it
/// (queue, batch, sink in-flight send). A deep copy is required whenever an
/// entry must be visible to more than one sink concurrently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntryId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub labels: Labels,
    pub fingerprint: Fingerprint,
    pub source_id: SourceId,
    pub attempt_count: u32,
    /// Byte position this entry brings its source's read cursor to. Used
    /// only to advance the durable `PositionStore` record once a sink (or
    /// the DLQ) has confirmed the entry, per the at-least-once invariant
    /// that position never advances past unconfirmed content (spec I1).
    pub cursor: Option<SourceCursor>,
}

impl LogEntry {
    pub fn new(source_id: SourceId, message: String, timestamp: DateTime<Utc>, labels: Labels) -> Self {
        let fingerprint = Fingerprint::compute(&source_id, &message, timestamp);
        Self {
            id: EntryId::new(),
            message,
            timestamp,
            labels,
            fingerprint,
            source_id,
            attempt_count: 0,
            cursor: None,
        }
    }

    /// Deep-copy for fan-out to multiple sinks. `Clone` already deep-copies
    /// every field here (no shared interior mutability), but this makes the
    /// multi-sink-fanout call site self-documenting.
    pub fn fanout_copy(&self) -> Self {
        self.clone()
    }
}

/// Crash-safe record of how far a watched file has been read.
///
/// Invariant: `byte_offset <= size_at_read`, and `byte_offset`
/// only decreases when a truncation is detected (new inode, or
/// `size < prior offset`), in which case it resets to 0.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub source_path: String,
    pub inode: u64,
    pub size_at_read: u64,
    pub byte_offset: u64,
    pub last_read_wall_time: DateTime<Utc>,
}

impl PositionRecord {
    pub fn fresh(source_path: String, inode: u64) -> Self {
        Self {
            source_path,
            inode,
            size_at_read: 0,
            byte_offset: 0,
            last_read_wall_time: Utc::now(),
        }
    }

    /// Whether a caller-reported `(inode, size)` observation implies the
    /// underlying file was rotated or truncated out from under us.
    pub fn is_rotated_by(&self, inode: u64, size: u64) -> bool {
        inode != self.inode || size < self.byte_offset
    }
}

/// Snapshot of a running container relevant to log capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerLogInfo {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub labels: Labels,
    pub log_driver: String,
    pub log_file_path: Option<String>,
    pub state: ContainerState,
    pub networks: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ContainerState {
    Running,
    Stopped,
}

/// Ordered batch of entries assembled by a dispatcher worker for a single
/// destination sink, bounded by both an entry count and a byte budget.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub entries: Vec<LogEntry>,
    pub byte_len: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.byte_len += entry.message.len();
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.byte_len = 0;
    }
}

/// Reason a [`LogEntry`] was written to the DLQ, preserved for operator
/// triage and for deciding reprocess eligibility.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureReasonTag {
    /// Destination rejected the payload for a reason that will never
    /// resolve on retry (bad schema, timestamp out of acceptable range).
    Permanent,
    /// Exhausted the dispatcher's retry budget, or the retry queue was
    /// full under the configured drop policy.
    ExhaustedRetries,
    /// Dropped under backpressure before a sink ever saw it.
    Dropped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    pub entry: LogEntry,
    pub failure_reason_tag: FailureReasonTag,
    pub first_failed_at: DateTime<Utc>,
    pub attempt_history: Vec<String>,
    pub destination_sink: String,
}
