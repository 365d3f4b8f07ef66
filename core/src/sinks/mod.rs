//! Delivery destinations. A [`Sink`] accepts a [`Batch`] and
//! reports how the dispatcher should treat it: delivered, retry later, or
//! permanently rejected. [`SinkSet`] fans a batch out to every configured
//! sink so the DLQ contract ("which destination rejected this entry")
//! stays per-sink rather than per-dispatch.
//!
//! Follows the `async_trait`-object pattern used elsewhere for pluggable
//! provider abstractions, with a singleton `reqwest::Client` per sink for
//! connection reuse.

pub mod local_file;
pub mod loki;

use async_trait::async_trait;

use crate::types::Batch;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Every entry in the batch was accepted by the destination.
    Success,
    /// Transient failure (network, 5xx, rate limit); re-enqueue the whole
    /// batch with `attempt_count` incremented.
    Retryable,
    /// Destination rejected the batch for a reason retrying won't fix
    /// (schema, timestamp out of range even after clamping); write straight
    /// to the DLQ.
    Permanent,
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, batch: &Batch) -> SendOutcome;

    /// Whether the sink currently believes it can accept traffic (circuit
    /// breaker state, local disk space, etc.), consulted by the dispatcher
    /// before scheduling a batch assembly for this sink.
    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// The configured set of destinations a dispatcher worker sends a batch to.
/// Spec §4.5 treats the primary (Loki) and secondary (local file) sinks
/// independently: a batch's fate at one sink never affects its fate at
/// another.
pub struct SinkSet {
    sinks: Vec<std::sync::Arc<dyn Sink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<std::sync::Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<dyn Sink>> {
        self.sinks.iter()
    }

    pub async fn close_all(&self) {
        for sink in &self.sinks {
            sink.close().await;
        }
    }
}
