//! Loki-compatible push sink. Groups entries by label set
//! into Loki "streams", sorts each stream ascending by timestamp (Loki
//! rejects out-of-order pushes within a stream), and ships via a process-wide
//! `reqwest::Client` so connections are pooled across every batch this
//! process ever sends.
//!
//! Uses a singleton-client-plus-semaphore pattern for bounding concurrent
//! outbound requests, and a `Success`/`Retry`/`DeadLetter` tri-state to
//! separate retryable failures from permanent ones, same as the job
//! dispatcher elsewhere in this codebase.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{SendOutcome, Sink};
use crate::timestamp::{TimestampLearner, Verdict};
use crate::types::{Batch, Labels};

#[derive(Clone, Debug)]
pub struct LokiSinkConfig {
    pub push_url: String,
    pub tenant_id: Option<String>,
    /// Bearer token or similar sent on an `Authorization` header, sourced
    /// from an environment variable rather than the config file itself —
    /// an env-only override, never committed config.
    pub auth_token: Option<String>,
    pub max_entries_per_batch: usize,
    pub min_entries_per_batch: usize,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub adaptive_batching: bool,
    /// Cap on how many bytes of a non-2xx response body are read for
    /// classification — the rest is still drained so the connection
    /// returns to the pool, just discarded unread.
    pub error_body_classification_cap: usize,
}

impl Default for LokiSinkConfig {
    fn default() -> Self {
        Self {
            push_url: "http://localhost:3100/loki/api/v1/push".to_string(),
            tenant_id: None,
            auth_token: None,
            max_entries_per_batch: 500,
            min_entries_per_batch: 25,
            max_concurrent_requests: 8,
            request_timeout: Duration::from_secs(10),
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            adaptive_batching: true,
            error_body_classification_cap: 4096,
        }
    }
}

/// Distinguishes the two permanent-failure shapes a rejected batch can take:
/// a timestamp rejection feeds the [`TimestampLearner`], a schema rejection
/// does not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PermanentReason {
    Timestamp,
    Schema,
}

#[derive(Serialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Serialize)]
struct PushStream {
    stream: Labels,
    values: Vec<[String; 2]>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    opened_at: Option<Instant>,
}

/// Primary remote sink. Holds one shared `reqwest::Client` (connection pool
/// configured at construction) guarded by a semaphore so the dispatcher's
/// worker pool can't open more than `max_concurrent_requests` sockets at
/// once against a single Loki endpoint.
pub struct LokiSink {
    config: LokiSinkConfig,
    client: Client,
    semaphore: Semaphore,
    breaker: Mutex<Breaker>,
    failure_count: AtomicU32,
    timestamp_learner: Arc<TimestampLearner>,
    /// Current AIMD-adjusted batch size ceiling, in entries. Dispatcher
    /// workers consult this when deciding how large a batch to assemble for
    /// this sink.
    adaptive_max_entries: AtomicUsize,
    pub requests_total: AtomicU64,
    pub http_errors_total: AtomicU64,
}

impl LokiSink {
    pub fn new(config: LokiSinkConfig, timestamp_learner: Arc<TimestampLearner>) -> crate::error::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout)
            .build()?;

        let initial_max = config.max_entries_per_batch;
        Ok(Self {
            semaphore: Semaphore::new(config.max_concurrent_requests),
            breaker: Mutex::new(Breaker {
                state: BreakerState::Closed,
                opened_at: None,
            }),
            failure_count: AtomicU32::new(0),
            timestamp_learner,
            adaptive_max_entries: AtomicUsize::new(initial_max),
            requests_total: AtomicU64::new(0),
            http_errors_total: AtomicU64::new(0),
            config,
            client,
        })
    }

    pub fn current_batch_ceiling(&self) -> usize {
        self.adaptive_max_entries.load(Ordering::Relaxed)
    }

    /// AIMD: additive increase on success, multiplicative decrease on
    /// failure, bounded by `[min_entries_per_batch, max_entries_per_batch]`.
    fn adjust_batch_ceiling(&self, success: bool) {
        if !self.config.adaptive_batching {
            return;
        }
        let current = self.adaptive_max_entries.load(Ordering::Relaxed);
        let next = if success {
            (current + 16).min(self.config.max_entries_per_batch)
        } else {
            (current / 2).max(self.config.min_entries_per_batch)
        };
        self.adaptive_max_entries.store(next, Ordering::Relaxed);
    }

    fn group_by_stream(&self, batch: &Batch) -> BTreeMap<Labels, Vec<(i64, String)>> {
        let mut streams: BTreeMap<Labels, Vec<(i64, String)>> = BTreeMap::new();
        for entry in &batch.entries {
            let nanos = entry
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| entry.timestamp.timestamp() * 1_000_000_000);
            streams
                .entry(entry.labels.clone())
                .or_default()
                .push((nanos, entry.message.clone()));
        }
        for values in streams.values_mut() {
            values.sort_by_key(|(ns, _)| *ns);
        }
        streams
    }

    async fn pre_filter(&self, batch: &Batch) -> Batch {
        let mut filtered = Batch::new();
        let now = chrono::Utc::now();
        for entry in &batch.entries {
            let (verdict, replacement) = self.timestamp_learner.validate(entry.timestamp, now).await;
            match verdict {
                Verdict::Accept => filtered.push(entry.clone()),
                Verdict::Clamp => {
                    let mut clamped = entry.clone();
                    clamped.timestamp = replacement.unwrap_or(now);
                    let (k, v) = TimestampLearner::clamp_label();
                    clamped.labels.insert(k.to_string(), v.to_string());
                    filtered.push(clamped);
                }
                Verdict::Reject => {}
            }
        }
        filtered
    }

    async fn breaker_allows_request(&self) -> bool {
        let mut breaker = self.breaker.lock().await;
        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if let Some(opened_at) = breaker.opened_at {
                    if opened_at.elapsed() >= self.config.circuit_breaker_cooldown {
                        breaker.state = BreakerState::HalfOpen;
                        return true;
                    }
                }
                false
            }
        }
    }

    async fn record_result(&self, success: bool) {
        let mut breaker = self.breaker.lock().await;
        if success {
            self.failure_count.store(0, Ordering::Relaxed);
            breaker.state = BreakerState::Closed;
            breaker.opened_at = None;
        } else {
            let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
            if breaker.state == BreakerState::HalfOpen
                || failures >= self.config.circuit_breaker_failure_threshold
            {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                warn!(failures, "loki circuit breaker opened");
            }
        }
    }

    /// Classifies a response into an outcome. 2xx is success; 429
    /// and 5xx are retryable; a 4xx whose body names a timestamp rejection
    /// ("too old"/"too new"/"out of order") is a permanent timestamp
    /// failure distinct from any other 4xx, which is a permanent schema
    /// failure. Any other 4xx not covered above is treated as retryable
    /// (conservatively — an unanticipated 4xx is more likely a transient
    /// misconfiguration than a payload the destination will never accept).
    fn classify_response(status: StatusCode, body: &str) -> (SendOutcome, Option<PermanentReason>) {
        if status.is_success() {
            return (SendOutcome::Success, None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return (SendOutcome::Retryable, None);
        }
        if status.is_client_error() {
            let lower = body.to_ascii_lowercase();
            if lower.contains("too old") || lower.contains("too new") || lower.contains("out of order") {
                return (SendOutcome::Permanent, Some(PermanentReason::Timestamp));
            }
            if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
                return (SendOutcome::Permanent, Some(PermanentReason::Schema));
            }
        }
        (SendOutcome::Retryable, None)
    }

    #[cfg(test)]
    fn classify_status(status: StatusCode) -> SendOutcome {
        Self::classify_response(status, "").0
    }

    /// Approximates `http_idle_connections`: the request-concurrency
    /// semaphore permits available right now, i.e. slots not currently
    /// holding an in-flight request against this sink's shared transport.
    pub fn idle_connection_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait::async_trait]
impl Sink for LokiSink {
    fn name(&self) -> &str {
        "loki"
    }

    async fn is_healthy(&self) -> bool {
        self.breaker_allows_request().await
    }

    async fn send(&self, batch: &Batch) -> SendOutcome {
        if batch.is_empty() {
            return SendOutcome::Success;
        }
        if !self.breaker_allows_request().await {
            return SendOutcome::Retryable;
        }

        let filtered = self.pre_filter(batch).await;
        if filtered.is_empty() {
            // every entry was rejected by the timestamp learner outright
            return SendOutcome::Permanent;
        }

        let oldest_age = filtered
            .entries
            .iter()
            .map(|e| chrono::Utc::now().signed_duration_since(e.timestamp))
            .max()
            .unwrap_or_else(chrono::Duration::zero);

        let streams = self
            .group_by_stream(&filtered)
            .into_iter()
            .map(|(stream, values)| PushStream {
                stream,
                values: values
                    .into_iter()
                    .map(|(ns, line)| [ns.to_string(), line])
                    .collect(),
            })
            .collect();

        let body = PushRequest { streams };

        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return SendOutcome::Retryable,
        };

        let mut req = self.client.post(&self.config.push_url).json(&body);
        if let Some(tenant) = &self.config.tenant_id {
            req = req.header("X-Scope-OrgID", tenant);
        }
        if let Some(token) = &self.config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let (outcome, reason) = match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    // 2xx bodies are typically empty (204); still fully
                    // drain so the connection returns to the pool (P5).
                    let _ = resp.bytes().await;
                    (SendOutcome::Success, None)
                } else {
                    // cap how much of an error body we buffer for
                    // classification, but the read still drains the
                    // socket so the connection is reusable either way.
                    let cap = self.config.error_body_classification_cap;
                    let text = resp.text().await.unwrap_or_default();
                    let truncated = safe_prefix(&text, cap);
                    Self::classify_response(status, truncated)
                }
            }
            Err(e) => {
                debug!(error = %e, "loki request failed");
                (SendOutcome::Retryable, None)
            }
        };
        if !matches!(outcome, SendOutcome::Success) {
            self.http_errors_total.fetch_add(1, Ordering::Relaxed);
        }
        if reason == Some(PermanentReason::Timestamp) {
            self.timestamp_learner.learn_from_rejection(oldest_age).await;
        }

        self.record_result(matches!(outcome, SendOutcome::Success))
            .await;
        self.adjust_batch_ceiling(matches!(outcome, SendOutcome::Success));
        outcome
    }

    /// Waits for every in-flight request permit to be released, so shutdown
    /// doesn't tear down the shared `reqwest::Client` out from under a
    /// request still in flight (spec §8 P5 teardown discipline).
    async fn close(&self) {
        let _ = self.semaphore.acquire_many(self.config.max_concurrent_requests as u32).await;
    }
}

/// Byte-prefix of `s` no longer than `max_bytes`, backed off to the nearest
/// preceding UTF-8 character boundary so it never panics on a body that
/// happens to split a multi-byte character at exactly the cap.
fn safe_prefix(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogEntry, SourceId};

    fn sink() -> LokiSink {
        LokiSink::new(
            LokiSinkConfig::default(),
            Arc::new(TimestampLearner::new(Default::default())),
        )
        .unwrap()
    }

    #[test]
    fn classifies_http_status_codes() {
        assert_eq!(LokiSink::classify_status(StatusCode::OK), SendOutcome::Success);
        assert_eq!(
            LokiSink::classify_status(StatusCode::TOO_MANY_REQUESTS),
            SendOutcome::Retryable
        );
        assert_eq!(
            LokiSink::classify_status(StatusCode::BAD_REQUEST),
            SendOutcome::Permanent
        );
        assert_eq!(
            LokiSink::classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            SendOutcome::Retryable
        );
    }

    #[test]
    fn classifies_timestamp_rejection_bodies_distinctly_from_schema() {
        let (outcome, reason) =
            LokiSink::classify_response(StatusCode::BAD_REQUEST, "entry too old for stream");
        assert_eq!(outcome, SendOutcome::Permanent);
        assert_eq!(reason, Some(PermanentReason::Timestamp));

        let (outcome, reason) =
            LokiSink::classify_response(StatusCode::BAD_REQUEST, "streams out of order");
        assert_eq!(outcome, SendOutcome::Permanent);
        assert_eq!(reason, Some(PermanentReason::Timestamp));

        let (outcome, reason) =
            LokiSink::classify_response(StatusCode::BAD_REQUEST, "invalid label set");
        assert_eq!(outcome, SendOutcome::Permanent);
        assert_eq!(reason, Some(PermanentReason::Schema));
    }

    #[test]
    fn safe_prefix_never_splits_a_utf8_character() {
        let s = "héllo";
        // 'é' is a 2-byte UTF-8 sequence starting at byte 1; a cap of 2
        // would split it if not backed off to the nearest boundary.
        assert_eq!(safe_prefix(s, 2), "h");
    }

    #[test]
    fn groups_entries_by_label_set_sorted_ascending() {
        let sink = sink();
        let mut batch = Batch::new();
        let mut labels_a = Labels::new();
        labels_a.insert("host".into(), "a".into());
        let base = chrono::Utc::now();
        batch.push(LogEntry::new(
            SourceId::for_file("/a"),
            "second".into(),
            base + chrono::Duration::seconds(1),
            labels_a.clone(),
        ));
        batch.push(LogEntry::new(
            SourceId::for_file("/a"),
            "first".into(),
            base,
            labels_a,
        ));
        let streams = sink.group_by_stream(&batch);
        assert_eq!(streams.len(), 1);
        let values = streams.values().next().unwrap();
        assert_eq!(values[0].1, "first");
        assert_eq!(values[1].1, "second");
    }

    #[tokio::test]
    async fn adaptive_ceiling_backs_off_on_failure() {
        let sink = sink();
        let before = sink.current_batch_ceiling();
        sink.adjust_batch_ceiling(false);
        assert!(sink.current_batch_ceiling() < before);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_failures() {
        let sink = sink();
        for _ in 0..sink.config.circuit_breaker_failure_threshold {
            sink.record_result(false).await;
        }
        assert!(!sink.breaker_allows_request().await);
    }
}
