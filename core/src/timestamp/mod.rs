//! Per-sink timestamp acceptance window. Remote log stores
//! commonly reject entries whose timestamp is too far in the past or
//! future; this learns the destination's actual acceptance window from
//! rejections rather than hard-coding it, and clamps borderline entries
//! instead of dead-lettering them outright.
//!
//! Uses the usual `RwLock<State>` + `AtomicU64` counters split: interior
//! state behind a single lock, hot counters kept as separate atomics so
//! reads never contend with the lock.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;

const CLAMPED_LABEL: &str = "_timestamp_clamped";

/// How an entry outside the learned window is handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClampMode {
    /// Rewrite the timestamp to the nearest window boundary and tag the
    /// entry with `_timestamp_clamped=true`.
    Adjust,
    /// Treat it as a permanent rejection; the caller should dead-letter it
    /// rather than forward a rewritten timestamp.
    Reject,
}

#[derive(Clone, Debug)]
pub struct TimestampLearnerConfig {
    pub max_acceptable_age: chrono::Duration,
    pub max_acceptable_future_skew: chrono::Duration,
    pub clamp_mode: ClampMode,
}

impl Default for TimestampLearnerConfig {
    fn default() -> Self {
        Self {
            max_acceptable_age: ChronoDuration::hours(24),
            max_acceptable_future_skew: ChronoDuration::minutes(10),
            clamp_mode: ClampMode::Adjust,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Within the window unchanged.
    Accept,
    /// Outside the window; clamp to the nearest boundary and tag the entry.
    Clamp,
    /// Even clamping wouldn't help (caller chose not to clamp, or entry is
    /// absurdly out of range) — treat as permanent rejection.
    Reject,
}

struct LearnedWindow {
    max_age: ChronoDuration,
    max_future_skew: ChronoDuration,
}

/// Tracks one learned acceptance window per destination sink. Narrows the
/// window when the sink rejects an entry for being too old/new, and widens
/// it back toward the configured default after sustained acceptance.
pub struct TimestampLearner {
    default_config: TimestampLearnerConfig,
    state: RwLock<LearnedWindow>,
    pub clamped_total: AtomicU64,
    pub rejected_total: AtomicU64,
    accepted_since_widen: AtomicU64,
}

impl TimestampLearner {
    pub fn new(config: TimestampLearnerConfig) -> Self {
        let state = LearnedWindow {
            max_age: config.max_acceptable_age,
            max_future_skew: config.max_acceptable_future_skew,
        };
        Self {
            default_config: config,
            state: RwLock::new(state),
            clamped_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            accepted_since_widen: AtomicU64::new(0),
        }
    }

    /// Checks `timestamp` against the current learned window relative to
    /// `now`, returning the verdict and (for `Clamp`) the replacement
    /// timestamp plus the label to attach.
    pub async fn validate(
        &self,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (Verdict, Option<DateTime<Utc>>) {
        let state = self.state.read().await;
        let age = now.signed_duration_since(timestamp);
        let out_of_window = age > state.max_age || age < -state.max_future_skew;

        if out_of_window {
            if self.default_config.clamp_mode == ClampMode::Reject {
                drop(state);
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                self.accepted_since_widen.store(0, Ordering::Relaxed);
                return (Verdict::Reject, None);
            }

            self.clamped_total.fetch_add(1, Ordering::Relaxed);
            let clamp_to = if age > state.max_age {
                now - state.max_age
            } else {
                now + state.max_future_skew
            };
            drop(state);
            return (Verdict::Clamp, Some(clamp_to));
        }

        drop(state);
        self.accepted_since_widen.fetch_add(1, Ordering::Relaxed);
        if self.accepted_since_widen.load(Ordering::Relaxed) >= 1000 {
            self.widen().await;
        }
        (Verdict::Accept, None)
    }

    /// Applies the label a clamp verdict should carry on the outgoing entry.
    pub fn clamp_label() -> (&'static str, &'static str) {
        (CLAMPED_LABEL, "true")
    }

    /// Narrows the learned window after the destination rejects an entry
    /// for timestamp reasons, so subsequent entries clamp proactively
    /// instead of round-tripping a rejection first.
    pub async fn learn_from_rejection(&self, rejected_age: ChronoDuration) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        if rejected_age > ChronoDuration::zero() && rejected_age < state.max_age {
            state.max_age = rejected_age;
        }
        self.accepted_since_widen.store(0, Ordering::Relaxed);
    }

    /// Relaxes the learned window back toward the configured default after
    /// a sustained run of acceptances, so a one-off rejection doesn't
    /// permanently over-clamp the stream.
    async fn widen(&self) {
        let mut state = self.state.write().await;
        let default_age = self.default_config.max_acceptable_age;
        if state.max_age < default_age {
            let step = (default_age - state.max_age) / 2;
            state.max_age = state.max_age + step.max(ChronoDuration::minutes(1));
            if state.max_age > default_age {
                state.max_age = default_age;
            }
        }
        self.accepted_since_widen.store(0, Ordering::Relaxed);
    }

    pub async fn current_max_age(&self) -> ChronoDuration {
        self.state.read().await.max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn within_window_accepts() {
        let learner = TimestampLearner::new(TimestampLearnerConfig::default());
        let now = Utc::now();
        let (verdict, _) = learner.validate(now - ChronoDuration::hours(1), now).await;
        assert_eq!(verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn too_old_clamps_to_window_edge() {
        let learner = TimestampLearner::new(TimestampLearnerConfig::default());
        let now = Utc::now();
        let (verdict, clamped) = learner.validate(now - ChronoDuration::days(5), now).await;
        assert_eq!(verdict, Verdict::Clamp);
        assert!(clamped.is_some());
        assert_eq!(learner.clamped_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn rejection_narrows_window() {
        let learner = TimestampLearner::new(TimestampLearnerConfig::default());
        let before = learner.current_max_age().await;
        learner.learn_from_rejection(ChronoDuration::hours(6)).await;
        let after = learner.current_max_age().await;
        assert!(after < before);
        assert_eq!(after, ChronoDuration::hours(6));
    }

    #[tokio::test]
    async fn future_skew_clamps() {
        let learner = TimestampLearner::new(TimestampLearnerConfig::default());
        let now = Utc::now();
        let (verdict, clamped) = learner.validate(now + ChronoDuration::hours(1), now).await;
        assert_eq!(verdict, Verdict::Clamp);
        assert!(clamped.unwrap() <= now + ChronoDuration::minutes(10));
    }

    #[tokio::test]
    async fn reject_mode_rejects_instead_of_clamping() {
        let learner = TimestampLearner::new(TimestampLearnerConfig {
            clamp_mode: ClampMode::Reject,
            ..Default::default()
        });
        let now = Utc::now();
        let (verdict, replacement) = learner.validate(now - ChronoDuration::days(5), now).await;
        assert_eq!(verdict, Verdict::Reject);
        assert!(replacement.is_none());
        assert_eq!(learner.rejected_total.load(Ordering::Relaxed), 1);
    }
}
