//! Global retry budget: caps how many entries per second
//! the dispatcher is willing to push onto the retry queue across all
//! sources, so a single flaky sink can't monopolize retry capacity at the
//! expense of fresh ingress. A standard token-bucket rate limiter, with
//! attempts/backoff/max expressed as plain config fields.

use std::sync::Mutex;

use tokio::time::Instant;

struct State {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(rate_per_second: f64, burst: f64) -> Self {
        Self {
            rate_per_second,
            burst,
            state: Mutex::new(State {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to withdraw `cost` tokens, refilling based on elapsed time
    /// first. Returns `false` if insufficient budget remains.
    pub fn try_consume(&self, cost: f64) -> bool {
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_burst_then_throttles() {
        let bucket = TokenBucket::new(1.0, 3.0);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(10.0, 1.0);
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        assert!(bucket.try_consume(1.0));
    }
}
